use std::sync::Arc;

use crate::config::RecorderConfig;
use crate::error::{RResult, RecorderError};
use crate::notify::{NotificationPort, Presence};
use crate::sensors::SensorHub;
use crate::session::{Effect, RecordSession, SessionPolicy, SessionStatus};
use crate::storage::{FinishedRecord, RecordStore, RetryingStore};
use crate::types::{ActivityTemplate, MotionEvent, PositionFix, Timestamp};

/// Owns the current session and carries out its effects.
///
/// Every method runs on the single consumer of the event queue, so sessions
/// never see concurrent mutation.
pub struct Engine<S: RecordStore, N: NotificationPort, H: SensorHub> {
    config: RecorderConfig,
    store: RetryingStore<S>,
    notifier: N,
    sensors: H,
    session: Option<RecordSession>,
    presence: Presence,
    sensors_held: bool,
    persistence_degraded: bool,
    /// Finished record the store refused, retried on every tick
    pending_commit: Option<FinishedRecord>,
    /// In-progress snapshot that still has to be cleared after a commit
    pending_clear: bool,
}

impl<S: RecordStore, N: NotificationPort, H: SensorHub> Engine<S, N, H> {
    pub fn new(config: RecorderConfig, store: S, notifier: N, sensors: H) -> Self {
        let retry = config.retry;
        Self {
            config,
            store: RetryingStore::new(store, retry),
            notifier,
            sensors,
            session: None,
            presence: Presence::default(),
            sensors_held: false,
            persistence_degraded: false,
            pending_commit: None,
            pending_clear: false,
        }
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        self.store.inner()
    }

    pub fn store_mut(&mut self) -> &mut S {
        self.store.inner_mut()
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    pub fn sensors(&self) -> &H {
        &self.sensors
    }

    pub fn presence(&self) -> Presence {
        self.presence
    }

    fn policy(&self) -> SessionPolicy {
        SessionPolicy::from(&self.config)
    }

    fn has_live_session(&self) -> bool {
        self.session.as_ref().map(|s| s.state().is_live()).unwrap_or(false)
    }

    /// Resume the in-progress record left by a previous run, if any.
    pub fn recover(&mut self) -> RResult<Option<SessionStatus>> {
        if self.has_live_session() {
            return Err(RecorderError::InvalidState("a record is already in progress".to_string()));
        }
        let snapshot = match self.store.load_in_progress()? {
            Some(snapshot) => snapshot,
            None => {
                log::debug!("[engine] nothing to recover");
                return Ok(None);
            }
        };
        let (session, effects) = RecordSession::resume(snapshot, self.policy())?;
        self.session = Some(session);
        self.apply(effects);
        Ok(self.status())
    }

    pub fn start(&mut self, activity: Arc<ActivityTemplate>, note: &str, now: Timestamp) -> RResult<SessionStatus> {
        if self.has_live_session() {
            return Err(RecorderError::InvalidState("a record is already in progress".to_string()));
        }
        self.flush_pending();
        if let Some(record) = &self.pending_commit {
            return Err(RecorderError::InvalidState(format!(
                "record {} is not committed yet",
                record.id
            )));
        }
        if self.pending_clear {
            return Err(RecorderError::InvalidState(
                "previous in-progress snapshot is not cleared yet".to_string(),
            ));
        }
        // An unrecovered record owns the snapshot slot until it is resumed or cancelled
        if let Some(orphan) = self.store.load_in_progress()? {
            return Err(RecorderError::InvalidState(format!(
                "record {} is still in progress, recover or cancel it first",
                orphan.record_id
            )));
        }

        let mut session = RecordSession::new(activity, self.policy());
        let effects = session.start(now, note)?;
        self.session = Some(session);
        self.apply(effects);
        self.current_status()
    }

    pub fn on_motion_event(&mut self, event: &MotionEvent) -> RResult<SessionStatus> {
        let effects = self.session_mut()?.on_motion_event(event)?;
        self.apply(effects);
        self.current_status()
    }

    pub fn on_position_fix(&mut self, fix: &PositionFix) -> RResult<SessionStatus> {
        let effects = self.session_mut()?.on_position_fix(fix)?;
        self.apply(effects);
        self.current_status()
    }

    pub fn increment(&mut self, now: Timestamp) -> RResult<SessionStatus> {
        let effects = self.session_mut()?.increment(now)?;
        self.apply(effects);
        self.current_status()
    }

    pub fn set_note(&mut self, note: &str) -> RResult<SessionStatus> {
        let effects = self.session_mut()?.set_note(note)?;
        self.apply(effects);
        self.current_status()
    }

    pub fn finish(&mut self, now: Timestamp) -> RResult<SessionStatus> {
        let effects = self.session_mut()?.finish(now)?;
        self.apply(effects);
        self.current_status()
    }

    /// Cancelling without a live session does nothing.
    pub fn cancel(&mut self, now: Timestamp) -> Option<SessionStatus> {
        let effects = self.session.as_mut()?.cancel(now);
        self.apply(effects);
        self.status()
    }

    /// Clock input. Retries pending persistence before the session checks.
    pub fn tick(&mut self, now: Timestamp) -> RResult<Option<SessionStatus>> {
        self.flush_pending();
        let effects = match self.session.as_mut() {
            Some(session) if session.state().is_live() => session.tick(now)?,
            _ => return Ok(self.status()),
        };
        self.apply(effects);
        Ok(self.status())
    }

    pub fn set_foreground(&mut self, foreground: bool) {
        if self.presence.foreground != foreground {
            log::debug!("[engine] foreground={}", foreground);
        }
        self.presence = Presence { foreground };
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.session.as_ref().map(|session| {
            let mut status = session.status();
            status.persistence_degraded = self.persistence_degraded;
            status.commit_pending = self.pending_commit.is_some();
            status
        })
    }

    pub fn is_persistence_degraded(&self) -> bool {
        self.persistence_degraded
    }

    pub fn session(&self) -> Option<&RecordSession> {
        self.session.as_ref()
    }

    /// Stop producers. A live record stays in its durable snapshot for the next `recover`.
    pub fn shutdown(&mut self) {
        self.flush_pending();
        self.release_sensors();
        if let Some(session) = self.session.as_ref().filter(|s| s.state().is_live()) {
            log::info!(
                "[engine] shutting down with {} in progress ({} repetition(s))",
                session.id(),
                session.repetitions()
            );
        }
    }

    fn session_mut(&mut self) -> RResult<&mut RecordSession> {
        self.session.as_mut().ok_or(RecorderError::NoActiveSession)
    }

    fn current_status(&self) -> RResult<SessionStatus> {
        self.status().ok_or(RecorderError::NoActiveSession)
    }

    fn release_sensors(&mut self) {
        if self.sensors_held {
            self.sensors.release();
            self.sensors_held = false;
        }
    }

    fn flush_pending(&mut self) {
        if let Some(record) = self.pending_commit.take() {
            match self.store.commit_finished(&record) {
                Ok(()) => {
                    log::info!("[engine] pending record {} committed", record.id);
                    self.persistence_degraded = false;
                }
                Err(err) => {
                    log::warn!("[engine] record {} still not committed: {}", record.id, err);
                    self.pending_commit = Some(record);
                    return;
                }
            }
        }
        if self.pending_clear {
            self.clear_in_progress();
        }
    }

    fn clear_in_progress(&mut self) {
        match self.store.clear_in_progress() {
            Ok(()) => self.pending_clear = false,
            Err(err) => {
                log::warn!("[engine] clearing in-progress snapshot failed: {}", err);
                self.pending_clear = true;
                self.persistence_degraded = true;
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::AcquireSensors(request) => {
                    if !request.is_empty() {
                        self.sensors.acquire(request);
                        self.sensors_held = true;
                    }
                }
                Effect::ReleaseSensors => self.release_sensors(),
                Effect::SaveSnapshot(snapshot) => match self.store.save_in_progress(&snapshot) {
                    Ok(()) => {
                        if self.persistence_degraded && self.pending_commit.is_none() && !self.pending_clear {
                            log::info!("[engine] persistence recovered at sequence {}", snapshot.sequence);
                            self.persistence_degraded = false;
                        }
                    }
                    Err(err) => {
                        // In-memory state stays authoritative; the next snapshot supersedes this one
                        log::warn!("[engine] snapshot {} not saved: {}", snapshot.sequence, err);
                        self.persistence_degraded = true;
                    }
                },
                Effect::Notify(kind) => self.notifier.play(kind, self.presence),
                Effect::Commit(record) => {
                    if let Err(err) = self.store.commit_finished(&record) {
                        log::error!("[engine] record {} not committed, will retry: {}", record.id, err);
                        self.persistence_degraded = true;
                        self.pending_commit = Some(record);
                    }
                }
                Effect::ClearInProgress => {
                    // Keep the snapshot until the finished record is durable
                    if self.pending_commit.is_some() {
                        self.pending_clear = true;
                    } else {
                        self.clear_in_progress();
                    }
                }
                Effect::Discard(snapshot) => {
                    if let Err(err) = self.store.discard(&snapshot) {
                        log::warn!("[engine] discarding {} failed: {}", snapshot.record_id, err);
                        self.persistence_degraded = true;
                    }
                }
            }
        }
    }
}

impl<S: RecordStore, N: NotificationPort, H: SensorHub> Drop for Engine<S, N, H> {
    fn drop(&mut self) {
        self.release_sensors();
    }
}
