use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "MCPSYNC_HOME";

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const DAEMON_LOCK: &str = "daemon.lock";
pub const DAEMON_CONFIG: &str = "daemon.yaml";
pub const DAEMON_LOG: &str = "daemon.log";

/// `$MCPSYNC_HOME` when set, else the user's home directory.
pub fn resolve_home() -> Option<PathBuf> {
    std::env::var_os(HOME_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
}

pub fn mcpsync_root(home: &Path) -> PathBuf {
    home.join(".mcpsync")
}

pub fn run_dir(home: &Path) -> PathBuf {
    mcpsync_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    mcpsync_root(home).join(DAEMON_SOCKET)
}

pub fn lock_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_LOCK)
}

pub fn config_path(home: &Path) -> PathBuf {
    mcpsync_root(home).join(DAEMON_CONFIG)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    mcpsync_root(home).join("logs")
}

pub fn log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_LOG)
}

/// Root of the file storage backend; the config lives at
/// `<root>/servers.yaml`.
pub fn storage_root(home: &Path) -> PathBuf {
    mcpsync_root(home)
}
