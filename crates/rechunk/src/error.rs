//! Error types for rechunk planning and execution.

use thiserror::Error;

/// Errors that can occur while planning or executing a rechunk.
#[derive(Error, Debug)]
pub enum RechunkError {
    /// The requested geometry cannot be realised within the configuration
    /// (memory budget too small, rank mismatch, zero-sized chunks, ...).
    /// Raised before any task is dispatched.
    #[error("configuration error: {0}")]
    Config(String),

    /// A copy task kept failing after all retries were used up.
    #[error("task {task} of stage '{stage}' failed after {attempts} attempt(s): {message}")]
    TaskFailed {
        stage: String,
        task: usize,
        attempts: u32,
        message: String,
    },

    /// An input does not satisfy a precondition of the operation.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// A store already exists at the target path.
    #[error("target store already exists at '{0}'; clear it explicitly before retrying")]
    TargetExists(String),

    /// The output store does not accept writes.
    #[error("store at '{0}' is not writable")]
    ReadOnly(String),

    /// Execution was abandoned before completion.
    #[error("execution cancelled")]
    Cancelled,

    /// Zarr format error.
    #[error("Zarr error: {0}")]
    Zarr(String),

    /// Storage/IO error.
    #[error("storage error: {0}")]
    Storage(String),
}

impl RechunkError {
    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a Precondition error.
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    /// Create a Zarr error.
    pub fn zarr(msg: impl ToString) -> Self {
        Self::Zarr(msg.to_string())
    }

    /// True for errors that are worth retrying at task level.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Zarr(_) | Self::Storage(_))
    }
}

impl From<storage::StorageError> for RechunkError {
    fn from(err: storage::StorageError) -> Self {
        match err {
            storage::StorageError::ReadOnly(path) => Self::ReadOnly(path),
            storage::StorageError::Config(msg) => Self::Config(msg),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<zarrs::storage::StorageError> for RechunkError {
    fn from(err: zarrs::storage::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Result type for rechunk operations.
pub type Result<T> = std::result::Result<T, RechunkError>;
