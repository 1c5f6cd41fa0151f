use thiserror::Error;

use crate::distance::RejectReason;

/// Recording engine error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecorderError {
    #[error("Invalid activity template: {0}")]
    InvalidTemplate(String),

    #[error("Session already closed")]
    SessionClosed,

    #[error("Position fix rejected: {reason}")]
    FixRejected { reason: RejectReason },

    #[error("Persistence failed during {operation} after {attempts} attempt(s): {message}")]
    PersistenceFailure {
        operation: &'static str,
        attempts: u32,
        message: String,
    },

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("No active session")]
    NoActiveSession,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Recorder stopped")]
    Stopped,
}

impl RecorderError {
    /// Errors the caller should log and move on from.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RecorderError::SessionClosed
                | RecorderError::FixRejected { .. }
                | RecorderError::PersistenceFailure { .. }
        )
    }
}

/// Result type for engine operations
pub type RResult<T> = Result<T, RecorderError>;

/// Errors raised by `RecordStore` implementations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stale snapshot: sequence {attempted} is older than stored {stored}")]
    Stale { stored: u64, attempted: u64 },
}

impl StoreError {
    /// Stale writes are refused permanently, everything else may succeed later.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StoreError::Stale { .. } | StoreError::Serialization(_))
    }
}
