//! Error types for mcpsync-sync.

use std::path::PathBuf;

use thiserror::Error;

/// Failures raised by a single [`Destination`](crate::Destination).
#[derive(Debug, Error)]
pub enum DestinationError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The destination's existing content is not valid JSON.
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The config could not be mapped onto the destination's shape.
    #[error("transform failed: {0}")]
    Transform(String),

    /// The existing document has an unexpected structure.
    #[error("unexpected document shape in {path}: {reason}")]
    Shape { path: PathBuf, reason: String },

    #[error("destination '{id}' does not support backups")]
    BackupUnsupported { id: String },
}

/// Errors returned to callers of the sync entry points. Per-destination
/// failures are never reported here; they land in
/// [`SyncResult::errors`](crate::SyncResult).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no destinations to sync")]
    NoDestinations,

    #[error("destination '{0}' not found")]
    UnknownDestination(String),

    #[error("destination '{0}' is already registered")]
    DestinationExists(String),
}

/// Convenience constructor for [`DestinationError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DestinationError {
    DestinationError::Io {
        path: path.into(),
        source,
    }
}
