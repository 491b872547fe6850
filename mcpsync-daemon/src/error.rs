use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use mcpsync_core::StoreError;
use mcpsync_sync::SyncError;

use crate::protocol::ErrorCode;

/// Single-instance lock failures.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("daemon already running{} (lock {path})", pid_suffix(.pid))]
    AlreadyRunning { pid: Option<u32>, path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn pid_suffix(pid: &Option<u32>) -> String {
    pid.map(|pid| format!(" as pid {pid}")).unwrap_or_default()
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("invalid ignore pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("cannot watch {path}: it has no file name")]
    NoFileName { path: PathBuf },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Auto-sync lifecycle errors. All but `Watch`/`Store` are coordination
/// errors returned immediately to the caller.
#[derive(Debug, Error)]
pub enum AutoSyncError {
    #[error("auto-sync is already running")]
    AlreadyRunning,

    #[error("auto-sync is not running")]
    NotRunning,

    #[error("auto-sync is {0}; retry once it settles")]
    Transitioning(&'static str),

    #[error("config source is not watchable ({0})")]
    Unwatchable(String),

    #[error("watcher error: {0}")]
    Watch(#[from] WatchError),

    #[error("config store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid daemon config {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{name} must be a number of milliseconds, got '{value}'")]
    Env { name: &'static str, value: String },

    #[error("cannot determine home directory; set MCPSYNC_HOME")]
    NoHome,
}

/// Client-side RPC failures, classified by [`ErrorCode`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon unavailable at {addr}: {source}")]
    Unavailable {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("call did not complete within {0:?}")]
    DeadlineExceeded(Duration),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("{message}")]
    Rpc { code: ErrorCode, message: String },
}

impl ClientError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Unavailable { .. } | ClientError::Io(_) => ErrorCode::Unavailable,
            ClientError::DeadlineExceeded(_) => ErrorCode::DeadlineExceeded,
            ClientError::Json(_) | ClientError::Protocol(_) => ErrorCode::Internal,
            ClientError::Rpc { code, .. } => *code,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// Error surface for daemon startup, runtime and shutdown.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("config store error: {0}")]
    Store(#[from] StoreError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("auto-sync error: {0}")]
    AutoSync(#[from] AutoSyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon socket already in use: {0}")]
    SocketInUse(PathBuf),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("{task} task join failure: {message}")]
    Join { task: &'static str, message: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
