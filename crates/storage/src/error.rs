//! Error types for store access and catalog resolution.

use thiserror::Error;

/// Errors raised while opening stores or resolving datasets.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The store could not be opened or created.
    #[error("failed to open store: {0}")]
    OpenFailed(String),

    /// A key or prefix was rejected by the store.
    #[error("invalid store key '{key}': {message}")]
    InvalidKey { key: String, message: String },

    /// Generic read/write failure reported by the backend.
    #[error("store I/O error: {0}")]
    Io(String),

    /// The store accepted no writes during a capability check.
    #[error("store at '{0}' is read-only")]
    ReadOnly(String),

    /// The catalog document could not be fetched or parsed.
    #[error("catalog error: {0}")]
    Catalog(String),

    /// The dataset id is not listed in the catalog.
    #[error("dataset not found in catalog: {0}")]
    NotFound(String),

    /// The dataset exists but does not provide the requested variable.
    #[error("dataset '{dataset}' has no variable '{variable}'")]
    UnknownVariable { dataset: String, variable: String },

    /// Invalid storage configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn open_failed(msg: impl Into<String>) -> Self {
        Self::OpenFailed(msg.into())
    }

    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn invalid_key(key: impl Into<String>, message: impl ToString) -> Self {
        Self::InvalidKey {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Catalog(err.to_string())
    }
}

impl From<zarrs::storage::StorageError> for StorageError {
    fn from(err: zarrs::storage::StorageError) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
