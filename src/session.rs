//! Record session state machine.
//!
//! A [`RecordSession`] never touches storage, sensors or notifications itself.
//! Every operation returns the list of [`Effect`]s the caller has to carry out,
//! in order. The engine applies them; tests inspect them directly.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::RecorderConfig;
use crate::distance::{DistanceTracker, FixOutcome};
use crate::error::{RResult, RecorderError};
use crate::notify::NotificationKind;
use crate::repetition::RepetitionDetector;
use crate::sensors::SensorRequest;
use crate::storage::{to_datetime, FinishTrigger, FinishedRecord, InProgressSnapshot};
use crate::types::{ActivityTemplate, MotionEvent, PositionFix, RepetitionMode, Timestamp};

/// Session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, not started
    Idle,
    /// Started with distance tracking, waiting for an accurate fix
    AwaitingFirstFix,
    Recording,
    Finished,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Finished | SessionState::Cancelled)
    }

    /// States that hold sensors and an in-progress snapshot
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::AwaitingFirstFix | SessionState::Recording)
    }
}

/// Recording policy resolved from the configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionPolicy {
    pub max_fix_accuracy_m: f64,
    pub signal_loss_after_ms: i64,
    pub axis_dead_band: f64,
    pub auto_finish_at_max: bool,
    /// 0 disables finish-on-covering
    pub finish_on_covering_ms: i64,
}

impl From<&RecorderConfig> for SessionPolicy {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            max_fix_accuracy_m: config.max_fix_accuracy_m,
            signal_loss_after_ms: config.signal_loss_after_ms(),
            axis_dead_band: config.axis_dead_band,
            auto_finish_at_max: config.auto_finish_at_max,
            finish_on_covering_ms: config.finish_on_covering_secs as i64 * 1000,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self::from(&RecorderConfig::default())
    }
}

/// Side effect requested by the session
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    AcquireSensors(SensorRequest),
    ReleaseSensors,
    SaveSnapshot(InProgressSnapshot),
    Notify(NotificationKind),
    Commit(FinishedRecord),
    ClearInProgress,
    Discard(InProgressSnapshot),
}

/// Point-in-time view of a session for callers and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub record_id: String,
    pub activity_id: i64,
    pub repetition_mode: RepetitionMode,
    pub state: SessionState,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub repetitions: u32,
    pub distance_m: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub last_fix_timestamp: Option<Timestamp>,
    pub signal_lost: bool,
    pub sequence: u64,
    /// Running duration up to the latest event or tick, final once ended
    #[serde(default)]
    pub elapsed_secs: f64,
    #[serde(default)]
    pub persistence_degraded: bool,
    #[serde(default)]
    pub commit_pending: bool,
}

/// One in-progress record
#[derive(Debug, Clone)]
pub struct RecordSession {
    id: String,
    activity: Arc<ActivityTemplate>,
    policy: SessionPolicy,
    state: SessionState,
    created_at: Option<Timestamp>,
    started_at: Option<Timestamp>,
    ended_at: Option<Timestamp>,
    repetitions: u32,
    note: String,
    detector: RepetitionDetector,
    tracker: DistanceTracker,
    covered_since: Option<Timestamp>,
    /// Latest timestamp seen from events or the clock
    last_seen: Option<Timestamp>,
    sequence: u64,
    finished_by: Option<FinishTrigger>,
}

impl RecordSession {
    pub fn new(activity: Arc<ActivityTemplate>, policy: SessionPolicy) -> Self {
        let detector = RepetitionDetector::for_template(&activity, policy.axis_dead_band);
        Self {
            id: String::new(),
            activity,
            policy,
            state: SessionState::Idle,
            created_at: None,
            started_at: None,
            ended_at: None,
            repetitions: 0,
            note: String::new(),
            detector,
            tracker: DistanceTracker::new(policy.max_fix_accuracy_m, policy.signal_loss_after_ms),
            covered_since: None,
            last_seen: None,
            sequence: 0,
            finished_by: None,
        }
    }

    /// Rebuild a live session from its last durable snapshot.
    pub fn resume(snapshot: InProgressSnapshot, policy: SessionPolicy) -> RResult<(Self, Vec<Effect>)> {
        if !snapshot.state.is_live() {
            return Err(RecorderError::InvalidState(format!(
                "snapshot {} is {:?}, only live sessions can resume",
                snapshot.record_id, snapshot.state
            )));
        }
        let session = Self {
            id: snapshot.record_id,
            activity: Arc::new(snapshot.activity),
            policy,
            state: snapshot.state,
            created_at: Some(snapshot.created_at),
            started_at: snapshot.started_at,
            ended_at: None,
            repetitions: snapshot.repetitions,
            note: snapshot.note,
            detector: snapshot.detector,
            tracker: snapshot.tracker,
            covered_since: snapshot.covered_since,
            last_seen: None,
            sequence: snapshot.sequence,
            finished_by: None,
        };
        log::info!(
            "[session] resumed {} in {:?} with {} repetition(s), {:.1} m",
            session.id,
            session.state,
            session.repetitions,
            session.tracker.distance_m()
        );
        let effects = vec![Effect::AcquireSensors(session.sensor_request())];
        Ok((session, effects))
    }

    /// Idle → AwaitingFirstFix when distance is tracked, otherwise Idle → Recording.
    pub fn start(&mut self, now: Timestamp, note: &str) -> RResult<Vec<Effect>> {
        if self.state != SessionState::Idle {
            return Err(RecorderError::InvalidState(format!(
                "cannot start a session that is {:?}",
                self.state
            )));
        }
        self.activity.validate()?;

        self.id = format!("record_{}", now);
        self.created_at = Some(now);
        self.note = note.to_string();
        if self.activity.distance_enabled {
            self.state = SessionState::AwaitingFirstFix;
            log::info!("[session] {} waiting for initial position", self.id);
        } else {
            self.state = SessionState::Recording;
            self.started_at = Some(now);
            log::info!("[session] {} recording '{}'", self.id, self.activity.name);
        }

        Ok(vec![
            Effect::AcquireSensors(self.sensor_request()),
            Effect::SaveSnapshot(self.next_snapshot()),
        ])
    }

    pub fn on_motion_event(&mut self, event: &MotionEvent) -> RResult<Vec<Effect>> {
        self.ensure_open()?;
        let now = event.timestamp;
        self.observe_clock(now);
        if self.state == SessionState::AwaitingFirstFix {
            log::debug!("[session] motion event before recording started, ignored");
            return Ok(Vec::new());
        }

        let mut effects = Vec::new();
        let mut accepted = false;

        if self.finish_on_covering_enabled() {
            if let Some(covered) = event.is_covered() {
                accepted = true;
                if !covered {
                    self.covered_since = None;
                } else if self.covered_since.is_none() {
                    self.covered_since = Some(now);
                }
            }
        }

        if self.detector.accepts(&event.payload) {
            accepted = true;
            if self.detector.observe(event, now) {
                self.repetitions += 1;
                effects.push(Effect::Notify(NotificationKind::RepetitionClick));
                if self.reached_max() {
                    log::info!("[session] {} reached {} repetitions", self.id, self.repetitions);
                    return Ok(self.finish_with(now, FinishTrigger::MaxRepetitions, effects));
                }
            }
        }

        if !accepted {
            log::debug!(
                "[session] {:?} payload ignored by {:?} detector",
                event.payload,
                self.detector.mode()
            );
            return Ok(effects);
        }

        if let Some(finish) = self.check_covering(now, &mut effects) {
            return Ok(finish);
        }
        effects.push(Effect::SaveSnapshot(self.next_snapshot()));
        Ok(effects)
    }

    pub fn on_position_fix(&mut self, fix: &PositionFix) -> RResult<Vec<Effect>> {
        self.ensure_open()?;
        if !self.activity.distance_enabled {
            log::debug!("[session] position fix ignored, distance tracking disabled");
            return Ok(Vec::new());
        }

        match self.tracker.accept(fix) {
            FixOutcome::Rejected { reason } => {
                log::debug!(
                    "[session] fix at {} rejected: {} (accuracy {:.1} m)",
                    fix.timestamp,
                    reason,
                    fix.accuracy
                );
                Err(RecorderError::FixRejected { reason })
            }
            FixOutcome::Accepted {
                first,
                restored,
                delta_m,
            } => {
                let mut effects = Vec::new();
                self.observe_clock(fix.timestamp);
                if self.state == SessionState::AwaitingFirstFix {
                    self.state = SessionState::Recording;
                    self.started_at = Some(fix.timestamp);
                    log::info!(
                        "[session] {} initial position found (accuracy {:.1} m, {}/{} satellites), recording",
                        self.id,
                        fix.accuracy,
                        fix.satellites_in_use,
                        fix.satellites_in_view
                    );
                    effects.push(Effect::Notify(NotificationKind::Start));
                } else if first {
                    log::debug!("[session] first fix while already recording");
                }
                if restored {
                    log::info!("[session] {} position signal restored", self.id);
                    effects.push(Effect::Notify(NotificationKind::SignalRestored));
                }
                log::debug!(
                    "[session] +{:.1} m, total {:.1} m",
                    delta_m,
                    self.tracker.distance_m()
                );
                effects.push(Effect::SaveSnapshot(self.next_snapshot()));
                Ok(effects)
            }
        }
    }

    /// Clock input for checks that depend on elapsed time only.
    pub fn tick(&mut self, now: Timestamp) -> RResult<Vec<Effect>> {
        self.ensure_open()?;
        self.observe_clock(now);
        let mut effects = Vec::new();

        if self.state == SessionState::Recording
            && self.activity.distance_enabled
            && self.tracker.check_signal(now)
        {
            log::warn!(
                "[session] {} no accurate position for {}s, still searching",
                self.id,
                self.policy.signal_loss_after_ms / 1000
            );
            effects.push(Effect::Notify(NotificationKind::SignalLost));
            effects.push(Effect::SaveSnapshot(self.next_snapshot()));
        }

        if let Some(finish) = self.check_covering(now, &mut effects) {
            return Ok(finish);
        }
        Ok(effects)
    }

    /// Manual repetition from the UI. Bypasses the sensor debounce.
    pub fn increment(&mut self, now: Timestamp) -> RResult<Vec<Effect>> {
        self.ensure_open()?;
        if self.state != SessionState::Recording {
            return Err(RecorderError::InvalidState("recording has not started yet".to_string()));
        }
        if !self.activity.uses_repetitions() {
            return Err(RecorderError::InvalidState(format!(
                "activity '{}' does not count repetitions",
                self.activity.name
            )));
        }

        self.observe_clock(now);
        self.repetitions += 1;
        self.detector.mark_repetition(now);
        let mut effects = vec![Effect::Notify(NotificationKind::RepetitionClick)];
        if self.reached_max() {
            return Ok(self.finish_with(now, FinishTrigger::MaxRepetitions, effects));
        }
        effects.push(Effect::SaveSnapshot(self.next_snapshot()));
        Ok(effects)
    }

    pub fn set_note(&mut self, note: &str) -> RResult<Vec<Effect>> {
        self.ensure_open()?;
        if self.note == note {
            return Ok(Vec::new());
        }
        self.note = note.to_string();
        Ok(vec![Effect::SaveSnapshot(self.next_snapshot())])
    }

    /// Recording → Finished
    pub fn finish(&mut self, now: Timestamp) -> RResult<Vec<Effect>> {
        self.ensure_open()?;
        if self.state == SessionState::AwaitingFirstFix {
            return Err(RecorderError::InvalidState(
                "no initial position yet, cancel instead".to_string(),
            ));
        }
        Ok(self.finish_with(now, FinishTrigger::User, Vec::new()))
    }

    /// Live → Cancelled. A no-op on sessions that are idle or already closed.
    pub fn cancel(&mut self, now: Timestamp) -> Vec<Effect> {
        if !self.state.is_live() {
            log::debug!("[session] cancel ignored in {:?}", self.state);
            return Vec::new();
        }
        self.state = SessionState::Cancelled;
        self.ended_at = Some(now);
        log::info!(
            "[session] {} cancelled ({} repetition(s), {:.1} m dropped)",
            self.id,
            self.repetitions,
            self.tracker.distance_m()
        );
        vec![
            Effect::ReleaseSensors,
            Effect::Discard(self.image()),
            Effect::ClearInProgress,
        ]
    }

    fn finish_with(&mut self, now: Timestamp, trigger: FinishTrigger, mut effects: Vec<Effect>) -> Vec<Effect> {
        self.state = SessionState::Finished;
        self.ended_at = Some(now);
        self.finished_by = Some(trigger);
        let record = self.to_record();
        log::info!(
            "[session] {} finished by {:?}: {} repetition(s), {:.1} m in {:.0}s",
            self.id,
            trigger,
            record.repetitions,
            record.distance_m,
            record.duration_secs
        );
        effects.push(Effect::ReleaseSensors);
        effects.push(Effect::Commit(record));
        effects.push(Effect::ClearInProgress);
        if trigger != FinishTrigger::User {
            effects.push(Effect::Notify(NotificationKind::Finish));
        }
        effects
    }

    fn check_covering(&mut self, now: Timestamp, effects: &mut Vec<Effect>) -> Option<Vec<Effect>> {
        if self.state != SessionState::Recording || !self.finish_on_covering_enabled() {
            return None;
        }
        let since = self.covered_since?;
        if now.saturating_sub(since) < self.policy.finish_on_covering_ms {
            return None;
        }
        log::info!("[session] {} proximity sensor covered since {}, finishing", self.id, since);
        Some(self.finish_with(now, FinishTrigger::Covering, std::mem::take(effects)))
    }

    fn observe_clock(&mut self, now: Timestamp) {
        if self.last_seen.map_or(true, |seen| now > seen) {
            self.last_seen = Some(now);
        }
    }

    /// Seconds since recording started, 0 before the first accurate fix.
    pub fn elapsed_secs(&self) -> f64 {
        let Some(start) = self.started_at else {
            return 0.0;
        };
        let end = self.ended_at.or(self.last_seen).unwrap_or(start);
        end.saturating_sub(start).max(0) as f64 / 1000.0
    }

    fn ensure_open(&self) -> RResult<()> {
        match self.state {
            SessionState::Idle => Err(RecorderError::InvalidState("session not started".to_string())),
            SessionState::Finished | SessionState::Cancelled => Err(RecorderError::SessionClosed),
            SessionState::AwaitingFirstFix | SessionState::Recording => Ok(()),
        }
    }

    fn reached_max(&self) -> bool {
        self.policy.auto_finish_at_max
            && self.activity.uses_repetitions()
            && self.repetitions >= self.activity.max_repetitions
    }

    fn finish_on_covering_enabled(&self) -> bool {
        // The proximity sensor cannot both count and finish
        self.policy.finish_on_covering_ms > 0 && self.detector.mode() != RepetitionMode::Proximity
    }

    pub fn sensor_request(&self) -> SensorRequest {
        SensorRequest {
            repetition_mode: self.detector.mode(),
            proximity_for_finish: self.finish_on_covering_enabled(),
            positioning: self.activity.distance_enabled,
        }
    }

    fn image(&self) -> InProgressSnapshot {
        InProgressSnapshot {
            sequence: self.sequence,
            record_id: self.id.clone(),
            activity: (*self.activity).clone(),
            state: self.state,
            created_at: self.created_at.unwrap_or_default(),
            started_at: self.started_at,
            repetitions: self.repetitions,
            note: self.note.clone(),
            detector: self.detector.clone(),
            tracker: self.tracker.clone(),
            covered_since: self.covered_since,
        }
    }

    fn next_snapshot(&mut self) -> InProgressSnapshot {
        self.sequence += 1;
        self.image()
    }

    /// Finished record for the current aggregates.
    pub fn to_record(&self) -> FinishedRecord {
        let created = self.created_at.unwrap_or_default();
        let start = self.started_at.unwrap_or(created);
        let end = self.ended_at.unwrap_or(start).max(start);
        let duration_secs = end.saturating_sub(start) as f64 / 1000.0;
        let time_per_repetition_secs = if self.repetitions > 0 {
            Some(duration_secs / self.repetitions as f64)
        } else {
            None
        };
        FinishedRecord {
            id: self.id.clone(),
            activity_id: self.activity.id,
            activity_name: self.activity.name.clone(),
            category_id: self.activity.category_id,
            started_at: to_datetime(start),
            ended_at: to_datetime(end),
            duration_secs,
            repetitions: self.repetitions,
            time_per_repetition_secs,
            distance_m: self.tracker.distance_m(),
            average_speed: self.tracker.average_speed(),
            max_speed: self.tracker.max_speed(),
            note: self.note.clone(),
            finished_by: self.finished_by.unwrap_or(FinishTrigger::User),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            record_id: self.id.clone(),
            activity_id: self.activity.id,
            repetition_mode: self.activity.repetition_mode,
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            repetitions: self.repetitions,
            distance_m: self.tracker.distance_m(),
            average_speed: self.tracker.average_speed(),
            max_speed: self.tracker.max_speed(),
            last_fix_timestamp: self.tracker.last_fix_timestamp(),
            signal_lost: self.tracker.is_signal_lost(),
            sequence: self.sequence,
            elapsed_secs: self.elapsed_secs(),
            persistence_degraded: false,
            commit_pending: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn activity(&self) -> &ActivityTemplate {
        &self.activity
    }

    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    pub fn distance_m(&self) -> f64 {
        self.tracker.distance_m()
    }

    pub fn started_at(&self) -> Option<Timestamp> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<Timestamp> {
        self.ended_at
    }

    pub fn note(&self) -> &str {
        &self.note
    }

    pub fn last_repetition_timestamp(&self) -> Option<Timestamp> {
        self.detector.last_repetition()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn finished_by(&self) -> Option<FinishTrigger> {
        self.finished_by
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::{haversine_distance, RejectReason};
    use approx::assert_relative_eq;

    fn push_ups(min: u32, max: u32, delay_ms: u32) -> Arc<ActivityTemplate> {
        Arc::new(ActivityTemplate::new(1, "Push-Ups", 1).with_repetitions(min, max, RepetitionMode::Proximity, delay_ms))
    }

    fn run() -> Arc<ActivityTemplate> {
        Arc::new(ActivityTemplate::new(2, "Run", 2).with_distance())
    }

    fn started(activity: Arc<ActivityTemplate>, policy: SessionPolicy) -> RecordSession {
        let mut session = RecordSession::new(activity, policy);
        session.start(0, "").unwrap();
        session
    }

    fn cover_cycle(session: &mut RecordSession, at: Timestamp) -> Vec<Effect> {
        let mut effects = session.on_motion_event(&MotionEvent::proximity(at, true)).unwrap();
        if session.state().is_live() {
            effects.extend(session.on_motion_event(&MotionEvent::proximity(at + 10, false)).unwrap());
        }
        effects
    }

    fn snapshots(effects: &[Effect]) -> Vec<u64> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::SaveSnapshot(s) => Some(s.sequence),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_without_distance_records_immediately() {
        let mut session = RecordSession::new(push_ups(5, 10, 0), SessionPolicy::default());
        assert_eq!(session.state(), SessionState::Idle);
        let effects = session.start(1_000, "morning").unwrap();

        assert_eq!(session.state(), SessionState::Recording);
        assert_eq!(session.started_at(), Some(1_000));
        assert_eq!(session.id(), "record_1000");
        assert!(matches!(effects[0], Effect::AcquireSensors(r) if r.repetition_mode == RepetitionMode::Proximity));
        assert_eq!(snapshots(&effects), vec![1]);
    }

    #[test]
    fn test_start_rejects_malformed_bounds() {
        let mut session = RecordSession::new(push_ups(10, 5, 0), SessionPolicy::default());
        let err = session.start(0, "").unwrap_err();
        assert!(matches!(err, RecorderError::InvalidTemplate(_)));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_start_twice_fails() {
        let mut session = started(push_ups(5, 10, 0), SessionPolicy::default());
        assert!(matches!(session.start(5, ""), Err(RecorderError::InvalidState(_))));
    }

    #[test]
    fn test_distance_gates_start_on_first_accurate_fix() {
        let mut session = RecordSession::new(run(), SessionPolicy::default());
        session.start(1_000, "").unwrap();
        assert_eq!(session.state(), SessionState::AwaitingFirstFix);
        assert_eq!(session.started_at(), None);

        let err = session.on_position_fix(&PositionFix::new(2_000, 48.0, 11.0, 120.0)).unwrap_err();
        assert_eq!(
            err,
            RecorderError::FixRejected {
                reason: RejectReason::LowAccuracy
            }
        );
        assert_eq!(session.state(), SessionState::AwaitingFirstFix);

        let effects = session.on_position_fix(&PositionFix::new(3_000, 48.0, 11.0, 8.0)).unwrap();
        assert_eq!(session.state(), SessionState::Recording);
        assert_eq!(session.started_at(), Some(3_000));
        assert!(effects.contains(&Effect::Notify(NotificationKind::Start)));
        assert_eq!(session.distance_m(), 0.0);
    }

    #[test]
    fn test_finish_while_awaiting_fix_fails() {
        let mut session = started(run(), SessionPolicy::default());
        assert!(matches!(session.finish(10), Err(RecorderError::InvalidState(_))));
        assert_eq!(session.state(), SessionState::AwaitingFirstFix);
    }

    #[test]
    fn test_motion_ignored_while_awaiting_fix() {
        let activity = Arc::new(
            ActivityTemplate::new(3, "Walking lunges", 1)
                .with_repetitions(1, 100, RepetitionMode::Proximity, 0)
                .with_distance(),
        );
        let mut session = started(activity, SessionPolicy::default());
        let effects = session.on_motion_event(&MotionEvent::proximity(5, true)).unwrap();
        assert!(effects.is_empty());
        assert_eq!(session.repetitions(), 0);
    }

    #[test]
    fn test_proximity_debounce_through_session() {
        let mut session = started(push_ups(5, 50, 1000), SessionPolicy::default());
        let mut clicks = 0;
        for at in [0, 50, 2000] {
            clicks += cover_cycle(&mut session, at)
                .iter()
                .filter(|e| **e == Effect::Notify(NotificationKind::RepetitionClick))
                .count();
        }
        assert_eq!(session.repetitions(), 2);
        assert_eq!(clicks, 2);
        assert_eq!(session.last_repetition_timestamp(), Some(2000));
    }

    #[test]
    fn test_auto_finish_at_max() {
        let mut session = started(push_ups(10, 10, 0), SessionPolicy::default());
        let mut last = Vec::new();
        for i in 0..10 {
            last = cover_cycle(&mut session, i * 100);
        }
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.repetitions(), 10);
        assert_eq!(session.finished_by(), Some(FinishTrigger::MaxRepetitions));
        assert_eq!(session.ended_at(), Some(900));
        assert!(last.contains(&Effect::ReleaseSensors));
        assert!(last.contains(&Effect::ClearInProgress));
        assert!(last.contains(&Effect::Notify(NotificationKind::Finish)));
        let record = last.iter().find_map(|e| match e {
            Effect::Commit(r) => Some(r.clone()),
            _ => None,
        });
        assert_eq!(record.unwrap().repetitions, 10);

        // Closed sessions refuse further events
        assert_eq!(
            session.on_motion_event(&MotionEvent::proximity(2_000, true)),
            Err(RecorderError::SessionClosed)
        );
    }

    #[test]
    fn test_auto_finish_disabled() {
        let policy = SessionPolicy {
            auto_finish_at_max: false,
            ..SessionPolicy::default()
        };
        let mut session = started(push_ups(2, 2, 0), policy);
        for i in 0..4 {
            cover_cycle(&mut session, i * 100);
        }
        assert_eq!(session.state(), SessionState::Recording);
        assert_eq!(session.repetitions(), 4);
    }

    #[test]
    fn test_finish_builds_record() {
        let mut session = RecordSession::new(push_ups(1, 50, 0), SessionPolicy::default());
        session.start(10_000, "first try").unwrap();
        for i in 0..4 {
            cover_cycle(&mut session, 11_000 + i * 1_000);
        }
        let effects = session.finish(30_000).unwrap();
        let record = effects
            .iter()
            .find_map(|e| match e {
                Effect::Commit(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();

        assert_eq!(record.id, "record_10000");
        assert_eq!(record.repetitions, 4);
        assert_eq!(record.duration_secs, 20.0);
        assert_eq!(record.time_per_repetition_secs, Some(5.0));
        assert_eq!(record.note, "first try");
        assert_eq!(record.finished_by, FinishTrigger::User);
        assert!(!effects.contains(&Effect::Notify(NotificationKind::Finish)));
        assert_eq!(session.finish(31_000), Err(RecorderError::SessionClosed));
    }

    #[test]
    fn test_cancel_discards() {
        let mut session = started(push_ups(1, 50, 0), SessionPolicy::default());
        cover_cycle(&mut session, 100);
        let effects = session.cancel(500);

        assert_eq!(session.state(), SessionState::Cancelled);
        assert_eq!(session.ended_at(), Some(500));
        assert!(effects.iter().all(|e| !matches!(e, Effect::Commit(_))));
        assert!(effects.iter().any(|e| matches!(e, Effect::Discard(s) if s.repetitions == 1)));
        assert!(effects.contains(&Effect::ClearInProgress));

        // Second cancel is a no-op and keeps the first end time
        assert!(session.cancel(900).is_empty());
        assert_eq!(session.ended_at(), Some(500));
    }

    #[test]
    fn test_cancel_while_awaiting_fix() {
        let mut session = started(run(), SessionPolicy::default());
        let effects = session.cancel(100);
        assert_eq!(session.state(), SessionState::Cancelled);
        assert!(!effects.is_empty());
    }

    #[test]
    fn test_signal_lost_and_restored() {
        let policy = SessionPolicy {
            signal_loss_after_ms: 180_000,
            ..SessionPolicy::default()
        };
        let mut session = started(run(), policy);
        session.on_position_fix(&PositionFix::new(0, 48.0, 11.0, 5.0)).unwrap();

        assert!(session.tick(100_000).unwrap().is_empty());
        let effects = session.tick(180_000).unwrap();
        assert!(effects.contains(&Effect::Notify(NotificationKind::SignalLost)));
        assert!(session.tick(200_000).unwrap().is_empty(), "one notification per episode");
        assert_eq!(session.state(), SessionState::Recording);

        let effects = session.on_position_fix(&PositionFix::new(210_000, 48.001, 11.0, 5.0)).unwrap();
        assert!(effects.contains(&Effect::Notify(NotificationKind::SignalRestored)));
        assert!(session.distance_m() > 100.0);
    }

    #[test]
    fn test_fix_ignored_without_distance() {
        let mut session = started(push_ups(1, 5, 0), SessionPolicy::default());
        let effects = session.on_position_fix(&PositionFix::new(0, 48.0, 11.0, 5.0)).unwrap();
        assert!(effects.is_empty());
        assert_eq!(session.distance_m(), 0.0);
    }

    #[test]
    fn test_distance_through_session() {
        let mut session = started(run(), SessionPolicy::default());
        let fixes = [
            PositionFix::new(0, 48.0, 11.0, 5.0),
            PositionFix::new(5_000, 48.0003, 11.0, 5.0),
            PositionFix::new(10_000, 48.0006, 11.0004, 5.0),
        ];
        for fix in &fixes {
            session.on_position_fix(fix).unwrap();
        }
        let expected = haversine_distance(48.0, 11.0, 48.0003, 11.0) + haversine_distance(48.0003, 11.0, 48.0006, 11.0004);
        assert_relative_eq!(session.distance_m(), expected, max_relative = 1e-12);

        let effects = session.finish(10_000).unwrap();
        let record = effects
            .iter()
            .find_map(|e| match e {
                Effect::Commit(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(record.duration_secs, 10.0);
        assert_relative_eq!(record.average_speed, expected / 10.0, max_relative = 1e-12);
        assert_eq!(record.time_per_repetition_secs, None);
    }

    #[test]
    fn test_finish_on_covering() {
        let policy = SessionPolicy {
            finish_on_covering_ms: 3_000,
            ..SessionPolicy::default()
        };
        let squats = Arc::new(
            ActivityTemplate::new(4, "Squats", 1).with_repetitions(1, 100, RepetitionMode::UprightAxis, 0),
        );
        let mut session = started(squats, policy);
        assert!(session.sensor_request().proximity_for_finish);

        session.on_motion_event(&MotionEvent::axis(100, 3.0)).unwrap();
        session.on_motion_event(&MotionEvent::proximity(1_000, true)).unwrap();
        // Uncovering resets the timer
        session.on_motion_event(&MotionEvent::proximity(2_000, false)).unwrap();
        session.on_motion_event(&MotionEvent::proximity(2_500, true)).unwrap();
        assert!(session.tick(5_000).unwrap().is_empty());

        let effects = session.tick(5_500).unwrap();
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.finished_by(), Some(FinishTrigger::Covering));
        assert_eq!(session.repetitions(), 1);
        assert!(effects.contains(&Effect::Notify(NotificationKind::Finish)));
    }

    #[test]
    fn test_covering_disabled_for_proximity_counting() {
        let policy = SessionPolicy {
            finish_on_covering_ms: 1_000,
            ..SessionPolicy::default()
        };
        let mut session = started(push_ups(1, 50, 0), policy);
        assert!(!session.sensor_request().proximity_for_finish);
        session.on_motion_event(&MotionEvent::proximity(0, true)).unwrap();
        session.tick(10_000).unwrap();
        assert_eq!(session.state(), SessionState::Recording);
    }

    #[test]
    fn test_manual_increment() {
        let mut session = started(push_ups(1, 3, 5_000), SessionPolicy::default());
        session.increment(100).unwrap();
        session.increment(200).unwrap();
        assert_eq!(session.repetitions(), 2);
        // Sensor debounce window now starts at the manual repetition
        cover_cycle(&mut session, 1_000);
        assert_eq!(session.repetitions(), 2);
        let effects = session.increment(300).unwrap();
        assert_eq!(session.state(), SessionState::Finished);
        assert!(effects.iter().any(|e| matches!(e, Effect::Commit(_))));

        let mut plain = started(Arc::new(ActivityTemplate::new(9, "Plank", 1)), SessionPolicy::default());
        assert!(matches!(plain.increment(10), Err(RecorderError::InvalidState(_))));
    }

    #[test]
    fn test_snapshot_sequence_is_monotonic() {
        let mut session = started(push_ups(1, 100, 0), SessionPolicy::default());
        let mut sequences = vec![session.sequence()];
        for i in 0..5 {
            sequences.extend(snapshots(&cover_cycle(&mut session, i * 100)));
        }
        sequences.extend(snapshots(&session.set_note("tired").unwrap()));
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_resume_replays_identically() {
        let activity = Arc::new(
            ActivityTemplate::new(5, "Burpees run", 1)
                .with_repetitions(1, 1000, RepetitionMode::UprightAxis, 300)
                .with_distance(),
        );
        let mut events: Vec<(Timestamp, Option<MotionEvent>, Option<PositionFix>)> = Vec::new();
        for i in 0..40i64 {
            let t = i * 250;
            let value = if i % 4 < 2 { 2.5 } else { -2.5 };
            events.push((t, Some(MotionEvent::axis(t, value)), None));
            if i % 5 == 0 {
                let accuracy = if i % 15 == 0 { 90.0 } else { 6.0 };
                events.push((t, None, Some(PositionFix::new(t, 48.0 + i as f64 * 0.00005, 11.0, accuracy))));
            }
        }
        let feed = |session: &mut RecordSession, slice: &[(Timestamp, Option<MotionEvent>, Option<PositionFix>)]| {
            let mut last_snapshot = None;
            for (_, motion, fix) in slice {
                let effects = match (motion, fix) {
                    (Some(m), _) => session.on_motion_event(m).unwrap(),
                    (_, Some(f)) => session.on_position_fix(f).unwrap_or_default(),
                    _ => Vec::new(),
                };
                for effect in effects {
                    if let Effect::SaveSnapshot(s) = effect {
                        last_snapshot = Some(s);
                    }
                }
            }
            last_snapshot
        };

        let mut uninterrupted = started(activity.clone(), SessionPolicy::default());
        feed(&mut uninterrupted, &events);

        let mut crashed = started(activity, SessionPolicy::default());
        let snapshot = feed(&mut crashed, &events[..30]).unwrap();
        drop(crashed);
        let (mut resumed, effects) = RecordSession::resume(snapshot, SessionPolicy::default()).unwrap();
        assert!(matches!(effects[0], Effect::AcquireSensors(_)));
        feed(&mut resumed, &events[30..]);

        assert!(uninterrupted.repetitions() > 0);
        assert_eq!(resumed.repetitions(), uninterrupted.repetitions());
        assert_eq!(resumed.distance_m(), uninterrupted.distance_m());
        assert_eq!(resumed.status().max_speed, uninterrupted.status().max_speed);
    }

    #[test]
    fn test_resume_rejects_terminal_snapshot() {
        let mut session = started(push_ups(1, 10, 0), SessionPolicy::default());
        let mut snapshot = session.next_snapshot();
        snapshot.state = SessionState::Finished;
        assert!(RecordSession::resume(snapshot, SessionPolicy::default()).is_err());
    }

    #[test]
    fn test_elapsed_follows_clock() {
        let mut session = RecordSession::new(run(), SessionPolicy::default());
        session.start(1_000, "").unwrap();
        session.tick(4_000).unwrap();
        assert_eq!(session.status().elapsed_secs, 0.0, "not started before the first fix");

        session.on_position_fix(&PositionFix::new(5_000, 48.0, 11.0, 5.0)).unwrap();
        session.tick(17_000).unwrap();
        assert_eq!(session.status().elapsed_secs, 12.0);
        // Late events do not move the clock backwards
        session.on_position_fix(&PositionFix::new(9_000, 48.0, 11.0, 90.0)).unwrap_err();
        session.tick(16_000).unwrap();
        assert_eq!(session.status().elapsed_secs, 12.0);

        session.finish(20_000).unwrap();
        assert_eq!(session.status().elapsed_secs, 15.0);
    }

    #[test]
    fn test_covering_with_extreme_timestamps() {
        let policy = SessionPolicy {
            finish_on_covering_ms: 1_000,
            ..SessionPolicy::default()
        };
        let mut session = RecordSession::new(Arc::new(ActivityTemplate::new(9, "Plank", 1)), policy);
        session.start(i64::MIN, "").unwrap();
        session.on_motion_event(&MotionEvent::proximity(i64::MIN, true)).unwrap();
        session.tick(i64::MAX).unwrap();
        assert_eq!(session.state(), SessionState::Finished);
        assert_eq!(session.finished_by(), Some(FinishTrigger::Covering));
    }
}
