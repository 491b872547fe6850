//! Error types for mcpsync-core.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a [`Storage`](crate::Storage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O failure, annotated with the path that was being touched.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The key cannot be mapped onto the backend (e.g. path traversal).
    #[error("invalid storage key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
}

/// All errors that can arise from [`ConfigStore`](crate::ConfigStore) operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The persisted config blob could not be parsed.
    #[error("failed to parse config '{key}': {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_yaml::Error,
    },

    /// The in-memory config could not be serialized for persistence.
    #[error("YAML serialization error: {0}")]
    Serialize(#[from] serde_yaml::Error),

    /// A validator rejected the input before any mutation happened.
    #[error("invalid server '{name}': {reason}")]
    Validation { name: String, reason: String },

    #[error("server '{name}' already exists")]
    ServerExists { name: String },

    #[error("server '{name}' not found")]
    ServerNotFound { name: String },
}

impl StoreError {
    /// `true` for errors caused by caller input rather than the environment.
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation { .. })
    }
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.into(),
        source,
    }
}
