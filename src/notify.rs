use serde::{Deserialize, Serialize};
use std::fmt;

/// Sounds and notifications the engine can ask for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RepetitionClick,
    Finish,
    Start,
    SignalLost,
    SignalRestored,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NotificationKind::RepetitionClick => "repetition_click",
            NotificationKind::Finish => "finish",
            NotificationKind::Start => "start",
            NotificationKind::SignalLost => "signal_lost",
            NotificationKind::SignalRestored => "signal_restored",
        };
        f.write_str(name)
    }
}

/// Host UI state at the moment a notification is raised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Presence {
    pub foreground: bool,
}

impl Presence {
    pub fn foreground() -> Self {
        Self { foreground: true }
    }

    pub fn background() -> Self {
        Self { foreground: false }
    }
}

/// Plays sounds or raises system notifications. Fire and forget.
pub trait NotificationPort {
    fn play(&mut self, kind: NotificationKind, presence: Presence);
}

/// Port that only writes to the log. Used by the CLI.
#[derive(Debug, Default)]
pub struct LogNotifier {
    played: u64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn played(&self) -> u64 {
        self.played
    }
}

impl NotificationPort for LogNotifier {
    fn play(&mut self, kind: NotificationKind, presence: Presence) {
        self.played += 1;
        // A visible UI shows the finished record itself
        if kind == NotificationKind::Finish && presence.foreground {
            log::debug!("[notify] finish (foreground, silent)");
            return;
        }
        log::info!(
            "[notify] {} ({})",
            kind,
            if presence.foreground { "foreground" } else { "background" }
        );
    }
}

/// Collects every call, for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct RecordingNotifier {
    pub calls: Vec<(NotificationKind, Presence)>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.calls.iter().map(|(k, _)| *k).collect()
    }

    pub fn count(&self, kind: NotificationKind) -> usize {
        self.calls.iter().filter(|(k, _)| *k == kind).count()
    }
}

impl NotificationPort for RecordingNotifier {
    fn play(&mut self, kind: NotificationKind, presence: Presence) {
        self.calls.push((kind, presence));
    }
}
