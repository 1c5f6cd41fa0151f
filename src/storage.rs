use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RetryConfig;
use crate::distance::DistanceTracker;
use crate::error::{RecorderError, StoreError};
use crate::repetition::RepetitionDetector;
use crate::session::SessionState;
use crate::types::{ActivityTemplate, Timestamp};

/// How a record came to be finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishTrigger {
    User,
    MaxRepetitions,
    Covering,
}

/// Durable image of a live session, written after every accepted event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InProgressSnapshot {
    /// Strictly increasing per session; stores refuse older sequences
    pub sequence: u64,
    pub record_id: String,
    pub activity: ActivityTemplate,
    pub state: SessionState,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub repetitions: u32,
    #[serde(default)]
    pub note: String,
    pub detector: RepetitionDetector,
    pub tracker: DistanceTracker,
    #[serde(default)]
    pub covered_since: Option<Timestamp>,
}

/// Completed record handed to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedRecord {
    pub id: String,
    pub activity_id: i64,
    pub activity_name: String,
    pub category_id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub repetitions: u32,
    pub time_per_repetition_secs: Option<f64>,
    pub distance_m: f64,
    pub average_speed: f64,
    pub max_speed: f64,
    pub note: String,
    pub finished_by: FinishTrigger,
}

pub fn to_datetime(ms: Timestamp) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Durable storage for finished and in-progress records
pub trait RecordStore {
    fn save_in_progress(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError>;
    fn load_in_progress(&mut self) -> Result<Option<InProgressSnapshot>, StoreError>;
    fn clear_in_progress(&mut self) -> Result<(), StoreError>;
    fn commit_finished(&mut self, record: &FinishedRecord) -> Result<(), StoreError>;
    /// Drop every trace of a cancelled record.
    fn discard(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError>;
}

/// Refuses to replace a snapshot with an older one.
pub fn check_monotonic(stored: Option<u64>, attempted: u64) -> Result<(), StoreError> {
    match stored {
        Some(stored) if attempted < stored => Err(StoreError::Stale { stored, attempted }),
        _ => Ok(()),
    }
}

/// In-memory store, used by tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    pub in_progress: Option<InProgressSnapshot>,
    pub finished: BTreeMap<String, FinishedRecord>,
    pub discarded: Vec<String>,
    pub writes: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn save_in_progress(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError> {
        check_monotonic(self.in_progress.as_ref().map(|s| s.sequence), snapshot.sequence)?;
        self.in_progress = Some(snapshot.clone());
        self.writes += 1;
        Ok(())
    }

    fn load_in_progress(&mut self) -> Result<Option<InProgressSnapshot>, StoreError> {
        Ok(self.in_progress.clone())
    }

    fn clear_in_progress(&mut self) -> Result<(), StoreError> {
        self.in_progress = None;
        Ok(())
    }

    fn commit_finished(&mut self, record: &FinishedRecord) -> Result<(), StoreError> {
        self.finished.insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn discard(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError> {
        self.finished.remove(&snapshot.record_id);
        self.discarded.push(snapshot.record_id.clone());
        Ok(())
    }
}

/// Decorator retrying failed store operations with exponential backoff.
///
/// Stale snapshots are never retried. When every attempt fails the last error
/// is reported as `RecorderError::PersistenceFailure`.
pub struct RetryingStore<S> {
    inner: S,
    retry: RetryConfig,
    failures: u64,
}

impl<S: RecordStore> RetryingStore<S> {
    pub fn new(inner: S, retry: RetryConfig) -> Self {
        Self {
            inner,
            retry,
            failures: 0,
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Operations that exhausted their attempts so far
    pub fn failures(&self) -> u64 {
        self.failures
    }

    fn run<T>(
        &mut self,
        operation: &'static str,
        mut op: impl FnMut(&mut S) -> Result<T, StoreError>,
    ) -> Result<T, RecorderError> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(&mut self.inner) {
                Ok(value) => {
                    if attempt > 1 {
                        log::info!("[store] {} succeeded after {} attempt(s)", operation, attempt);
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "[store] {} attempt {} failed: {}, retrying in {:.3}s",
                        operation,
                        attempt,
                        err,
                        delay.as_secs_f64()
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.failures += 1;
                    return Err(RecorderError::PersistenceFailure {
                        operation,
                        attempts: attempt,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    pub fn save_in_progress(&mut self, snapshot: &InProgressSnapshot) -> Result<(), RecorderError> {
        self.run("save_in_progress", |s| s.save_in_progress(snapshot))
    }

    pub fn load_in_progress(&mut self) -> Result<Option<InProgressSnapshot>, RecorderError> {
        self.run("load_in_progress", |s| s.load_in_progress())
    }

    pub fn clear_in_progress(&mut self) -> Result<(), RecorderError> {
        self.run("clear_in_progress", |s| s.clear_in_progress())
    }

    pub fn commit_finished(&mut self, record: &FinishedRecord) -> Result<(), RecorderError> {
        self.run("commit_finished", |s| s.commit_finished(record))
    }

    pub fn discard(&mut self, snapshot: &InProgressSnapshot) -> Result<(), RecorderError> {
        self.run("discard", |s| s.discard(snapshot))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::RepetitionMode;

    pub(crate) fn sample_snapshot(sequence: u64) -> InProgressSnapshot {
        let activity = ActivityTemplate::new(1, "Push-Ups", 1).with_repetitions(5, 10, RepetitionMode::Proximity, 0);
        InProgressSnapshot {
            sequence,
            record_id: "record_1000".to_string(),
            detector: RepetitionDetector::for_template(&activity, 1.5),
            activity,
            state: SessionState::Recording,
            created_at: 1000,
            started_at: Some(1000),
            repetitions: sequence as u32,
            note: String::new(),
            tracker: DistanceTracker::default(),
            covered_since: None,
        }
    }

    /// Fails the first `fail_next` operations with an I/O error
    #[derive(Default)]
    pub(crate) struct FlakyStore {
        pub inner: MemoryStore,
        pub fail_next: u32,
        pub calls: u32,
    }

    impl FlakyStore {
        fn gate(&mut self) -> Result<(), StoreError> {
            self.calls += 1;
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(StoreError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "storage offline",
                )));
            }
            Ok(())
        }
    }

    impl RecordStore for FlakyStore {
        fn save_in_progress(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.save_in_progress(snapshot)
        }

        fn load_in_progress(&mut self) -> Result<Option<InProgressSnapshot>, StoreError> {
            self.gate()?;
            self.inner.load_in_progress()
        }

        fn clear_in_progress(&mut self) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.clear_in_progress()
        }

        fn commit_finished(&mut self, record: &FinishedRecord) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.commit_finished(record)
        }

        fn discard(&mut self, snapshot: &InProgressSnapshot) -> Result<(), StoreError> {
            self.gate()?;
            self.inner.discard(snapshot)
        }
    }

    #[test]
    fn test_memory_store_rejects_stale_snapshot() {
        let mut store = MemoryStore::new();
        store.save_in_progress(&sample_snapshot(3)).unwrap();
        // Same sequence is an idempotent rewrite
        store.save_in_progress(&sample_snapshot(3)).unwrap();
        let err = store.save_in_progress(&sample_snapshot(2)).unwrap_err();
        assert!(matches!(err, StoreError::Stale { stored: 3, attempted: 2 }));
        assert_eq!(store.in_progress.as_ref().unwrap().sequence, 3);

        store.clear_in_progress().unwrap();
        store.save_in_progress(&sample_snapshot(1)).unwrap();
    }

    #[test]
    fn test_retry_recovers_from_transient_failure() {
        let flaky = FlakyStore {
            fail_next: 2,
            ..Default::default()
        };
        let mut store = RetryingStore::new(flaky, RetryConfig::immediate(3));
        store.save_in_progress(&sample_snapshot(1)).unwrap();
        assert_eq!(store.inner().calls, 3);
        assert_eq!(store.failures(), 0);
        assert!(store.inner().inner.in_progress.is_some());
    }

    #[test]
    fn test_retry_gives_up() {
        let flaky = FlakyStore {
            fail_next: 10,
            ..Default::default()
        };
        let mut store = RetryingStore::new(flaky, RetryConfig::immediate(3));
        let err = store.save_in_progress(&sample_snapshot(1)).unwrap_err();
        match err {
            RecorderError::PersistenceFailure {
                operation, attempts, ..
            } => {
                assert_eq!(operation, "save_in_progress");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.failures(), 1);
    }

    #[test]
    fn test_stale_is_not_retried() {
        let mut store = RetryingStore::new(FlakyStore::default(), RetryConfig::immediate(5));
        store.save_in_progress(&sample_snapshot(4)).unwrap();
        assert!(store.save_in_progress(&sample_snapshot(3)).is_err());
        assert_eq!(store.inner().calls, 2);
    }

    #[test]
    fn test_discard_removes_record() {
        let mut store = MemoryStore::new();
        let snapshot = sample_snapshot(1);
        store.discard(&snapshot).unwrap();
        assert!(store.finished.is_empty());
        assert_eq!(store.discarded, vec!["record_1000".to_string()]);
    }

    #[test]
    fn test_snapshot_json_roundtrip_keeps_detector_state() {
        let snapshot = sample_snapshot(7);
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: InProgressSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, snapshot);
    }
}
