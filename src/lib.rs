//! Activity recording engine.
//!
//! Turns proximity, accelerometer and satellite positioning events into
//! repetition counts, distance and speed for one in-progress record, keeps
//! that record crash-safe through monotonic snapshots, and commits it when
//! the user or the sensors finish it.

pub mod config;
pub mod distance;
pub mod engine;
pub mod error;
pub mod file_store;
pub mod notify;
pub mod repetition;
pub mod runtime;
pub mod sensors;
pub mod session;
pub mod storage;
pub mod types;
pub mod units;

pub use config::{RecorderConfig, RetryConfig};
pub use distance::{haversine_distance, DistanceTracker, FixOutcome, RejectReason};
pub use engine::Engine;
pub use error::{RResult, RecorderError, StoreError};
pub use file_store::JsonFileStore;
pub use notify::{LogNotifier, NotificationKind, NotificationPort, Presence, RecordingNotifier};
pub use repetition::RepetitionDetector;
pub use runtime::{Command, Recorder, RecorderHandle};
pub use sensors::{LogSensorHub, SensorHub, SensorRequest};
pub use session::{Effect, RecordSession, SessionPolicy, SessionState, SessionStatus};
pub use storage::{FinishTrigger, FinishedRecord, InProgressSnapshot, MemoryStore, RecordStore, RetryingStore};
pub use types::{ActivityTemplate, MotionEvent, MotionPayload, PositionFix, RepetitionMode, Timestamp};
pub use units::UnitSystem;
