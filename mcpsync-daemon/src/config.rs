//! Daemon configuration.
//!
//! `daemon.yaml` is optional and every field in it is optional;
//! [`DaemonConfig::apply_defaults`] resolves it against a home directory
//! into [`DaemonSettings`], which is what the runtime consumes.

use std::fmt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use mcpsync_sync::FileDestinationSpec;

use crate::error::ConfigError;
use crate::log_rotation::RotationPolicy;
use crate::paths;

pub const IDLE_TIMEOUT_ENV: &str = "MCPSYNC_IDLE_TIMEOUT_MS";

pub const DEFAULT_IDLE_CHECK: Duration = Duration::from_secs(1);
/// A zero period would make the idle monitor's ticker panic.
pub const MIN_IDLE_CHECK: Duration = Duration::from_millis(1);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SYNC_CONCURRENCY: usize = 4;
pub const DEFAULT_RESUME_DELAY: Duration = Duration::from_secs(2);

/// Where the RPC server listens: `unix:<path>` or `tcp:<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s.strip_prefix("tcp:") {
            return addr
                .parse()
                .map(ListenAddr::Tcp)
                .map_err(|e| format!("invalid TCP address '{addr}': {e}"));
        }
        Err(format!("listen address must start with unix: or tcp:, got '{s}'"))
    }
}

impl TryFrom<String> for ListenAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ListenAddr> for String {
    fn from(addr: ListenAddr) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddr::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    File {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        root: Option<PathBuf>,
    },
    Memory,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<usize>,
}

/// On-disk shape of `daemon.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<ListenAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,
    /// `0` disables the idle monitor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_check_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_delay_ms: Option<u64>,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub watch_ignore: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<FileDestinationSpec>,
}

/// Resolved storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    File(PathBuf),
    Memory,
}

/// Fully resolved daemon settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonSettings {
    pub home: PathBuf,
    pub listen: ListenAddr,
    pub lock_file: PathBuf,
    pub storage: StorageBackend,
    pub idle_timeout: Duration,
    pub idle_check: Duration,
    pub shutdown_timeout: Duration,
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub sync_concurrency: usize,
    pub resume_delay: Duration,
    pub log_file: Option<PathBuf>,
    pub log_rotation: RotationPolicy,
    pub watch_ignore: Vec<String>,
    pub destinations: Vec<FileDestinationSpec>,
}

impl DaemonConfig {
    /// Read `path`; a missing file is an empty config.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// `<home>/.mcpsync/daemon.yaml`, then environment overrides.
    pub fn load_for_home(home: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(&paths::config_path(home))?;
        config.apply_env()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(IDLE_TIMEOUT_ENV) {
            let ms = value.trim().parse::<u64>().map_err(|_| ConfigError::Env {
                name: IDLE_TIMEOUT_ENV,
                value: value.clone(),
            })?;
            self.idle_timeout_ms = Some(ms);
        }
        Ok(())
    }

    pub fn apply_defaults(self, home: &Path) -> DaemonSettings {
        let ms = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };
        let storage = match self.storage {
            None | Some(StorageConfig::File { root: None }) => {
                StorageBackend::File(paths::storage_root(home))
            }
            Some(StorageConfig::File { root: Some(root) }) => StorageBackend::File(root),
            Some(StorageConfig::Memory) => StorageBackend::Memory,
        };
        let defaults = RotationPolicy::default();

        DaemonSettings {
            home: home.to_path_buf(),
            listen: self
                .listen
                .unwrap_or_else(|| ListenAddr::Unix(paths::socket_path(home))),
            lock_file: self.lock_file.unwrap_or_else(|| paths::lock_path(home)),
            storage,
            idle_timeout: ms(self.idle_timeout_ms, Duration::ZERO),
            idle_check: ms(self.idle_check_ms, DEFAULT_IDLE_CHECK).max(MIN_IDLE_CHECK),
            shutdown_timeout: ms(self.shutdown_timeout_ms, DEFAULT_SHUTDOWN_TIMEOUT),
            max_connections: self
                .max_connections
                .unwrap_or(DEFAULT_MAX_CONNECTIONS)
                .max(1),
            read_timeout: ms(self.read_timeout_ms, DEFAULT_READ_TIMEOUT),
            sync_concurrency: self
                .sync_concurrency
                .unwrap_or(DEFAULT_SYNC_CONCURRENCY)
                .max(1),
            resume_delay: ms(self.resume_delay_ms, DEFAULT_RESUME_DELAY),
            log_file: self.log.file,
            log_rotation: RotationPolicy {
                max_bytes: self.log.max_bytes.unwrap_or(defaults.max_bytes),
                max_files: self.log.max_files.unwrap_or(defaults.max_files),
            },
            watch_ignore: self.watch_ignore,
            destinations: self.destinations,
        }
    }
}

impl DaemonSettings {
    /// `daemon.yaml` plus environment, resolved against `home`.
    pub fn load(home: &Path) -> Result<Self, ConfigError> {
        Ok(DaemonConfig::load_for_home(home)?.apply_defaults(home))
    }

    /// Defaults for `home` with no config file and no environment.
    pub fn for_home(home: &Path) -> Self {
        DaemonConfig::default().apply_defaults(home)
    }

    pub fn idle_monitor_enabled(&self) -> bool {
        !self.idle_timeout.is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_resolves_to_defaults() {
        let home = TempDir::new().unwrap();
        let config = DaemonConfig::load(&paths::config_path(home.path())).unwrap();
        let settings = config.apply_defaults(home.path());

        assert_eq!(
            settings.listen,
            ListenAddr::Unix(home.path().join(".mcpsync/daemon.sock"))
        );
        assert_eq!(settings.lock_file, home.path().join(".mcpsync/run/daemon.lock"));
        assert_eq!(
            settings.storage,
            StorageBackend::File(home.path().join(".mcpsync"))
        );
        assert!(!settings.idle_monitor_enabled());
        assert_eq!(settings.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);
        assert_eq!(settings.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(settings.log_rotation, RotationPolicy::default());
    }

    #[test]
    fn yaml_overrides_are_applied() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("daemon.yaml");
        std::fs::write(
            &path,
            r#"
listen: "tcp:127.0.0.1:7410"
storage:
  kind: memory
idle_timeout_ms: 250
idle_check_ms: 0
sync_concurrency: 0
log:
  file: /var/log/mcpsync.log
  max_files: 2
destinations:
  - id: editor
    path: /tmp/editor.json
"#,
        )
        .unwrap();

        let settings = DaemonConfig::load(&path).unwrap().apply_defaults(home.path());
        assert_eq!(
            settings.listen,
            ListenAddr::Tcp("127.0.0.1:7410".parse().unwrap())
        );
        assert_eq!(settings.storage, StorageBackend::Memory);
        assert_eq!(settings.idle_timeout, Duration::from_millis(250));
        assert_eq!(settings.idle_check, MIN_IDLE_CHECK);
        assert_eq!(settings.sync_concurrency, 1);
        assert_eq!(settings.log_rotation.max_files, 2);
        assert_eq!(settings.destinations.len(), 1);
        assert_eq!(settings.destinations[0].servers_key, "mcpServers");
    }

    #[test]
    fn listen_addr_parses_both_forms() {
        assert_eq!(
            "unix:/run/mcpsync.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/run/mcpsync.sock"))
        );
        let tcp: ListenAddr = "tcp:127.0.0.1:0".parse().unwrap();
        assert_eq!(tcp.to_string(), "tcp:127.0.0.1:0");
        assert!("localhost:80".parse::<ListenAddr>().is_err());
    }

    #[test]
    fn settings_load_from_the_home_config_file() {
        use assert_fs::prelude::*;

        let home = assert_fs::TempDir::new().unwrap();
        home.child(".mcpsync/daemon.yaml")
            .write_str("max_connections: 3\nwatch_ignore: [\"*.bak\"]\n")
            .unwrap();

        let settings = DaemonSettings::load(home.path()).unwrap();
        assert_eq!(settings.max_connections, 3);
        assert_eq!(settings.watch_ignore, vec!["*.bak".to_string()]);
        assert_eq!(settings.home, home.path());
    }

    #[test]
    fn malformed_yaml_names_the_file() {
        let home = TempDir::new().unwrap();
        let path = home.path().join("daemon.yaml");
        std::fs::write(&path, "idle_timeout_ms: [").unwrap();
        let err = DaemonConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("daemon.yaml"), "got: {err}");
    }
}
