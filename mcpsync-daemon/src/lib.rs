//! mcpsync daemon: single-instance process hosting the sync service over a
//! line-JSON RPC socket, with debounced auto-sync.

pub mod autosync;
pub mod client;
pub mod config;
pub mod debounce;
mod error;
pub mod lock;
pub mod log_rotation;
pub mod paths;
pub mod protocol;
pub mod retry;
mod runtime;
pub mod server;
pub mod watcher;

pub use autosync::{AutoSyncCoordinator, AutoSyncPhase, AutoSyncStatus};
pub use client::{DaemonClient, EventStream};
pub use config::{DaemonConfig, DaemonSettings, ListenAddr};
pub use error::{AutoSyncError, ClientError, ConfigError, DaemonError, LockError, WatchError};
pub use lock::{FileLock, SingleInstanceLock};
pub use protocol::{DaemonRequest, DaemonResponse, ErrorCode};
pub use retry::{RetryPolicy, RetryingClient};
pub use runtime::{init_tracing, run, start_blocking, Daemon};
