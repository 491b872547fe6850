//! Domain types for the server configuration document.
//!
//! A [`Config`] maps unique [`ServerName`]s to [`ServerConfig`] records. Every
//! record has exactly one [`Transport`]; the enum keeps the local-process and
//! remote field groups mutually exclusive.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed, unique server name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerName(pub String);

impl ServerName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ServerName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ServerName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// How a server is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Transport {
    /// A local process speaking over stdin/stdout.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// A remote endpoint.
    #[serde(alias = "sse", alias = "streamable-http")]
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

/// Discriminant of [`Transport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Stdio,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stdio => write!(f, "stdio"),
            TransportKind::Http => write!(f, "http"),
        }
    }
}

impl Transport {
    pub fn stdio(command: impl Into<String>) -> Self {
        Transport::Stdio {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn http(url: impl Into<String>) -> Self {
        Transport::Http {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Stdio { .. } => TransportKind::Stdio,
            Transport::Http { .. } => TransportKind::Http,
        }
    }

    /// The command (stdio) or URL (http) this transport points at.
    pub fn target(&self) -> &str {
        match self {
            Transport::Stdio { command, .. } => command,
            Transport::Http { url, .. } => url,
        }
    }
}

// ---------------------------------------------------------------------------
// Server record
// ---------------------------------------------------------------------------

fn default_enabled() -> bool {
    true
}

fn now() -> DateTime<Utc> {
    Utc::now()
}

/// A single named server record plus its internal metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "now")]
    pub modified_at: DateTime<Utc>,
    /// Where the record came from (`api`, `import:<file>`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Destination ids this server is restricted to. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_destinations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_destinations: Vec<String>,
}

impl ServerConfig {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            enabled: true,
            modified_at: Utc::now(),
            source: None,
            include_destinations: Vec::new(),
            exclude_destinations: Vec::new(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Whether this record should be written to `destination`.
    pub fn routes_to(&self, destination: &str) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.include_destinations.is_empty()
            && !self.include_destinations.iter().any(|d| d == destination)
        {
            return false;
        }
        !self.exclude_destinations.iter().any(|d| d == destination)
    }

    /// Content equality, ignoring bookkeeping (`modified_at`, `source`).
    pub fn same_content(&self, other: &ServerConfig) -> bool {
        self.transport == other.transport
            && self.enabled == other.enabled
            && self.include_destinations == other.include_destinations
            && self.exclude_destinations == other.exclude_destinations
    }
}

// ---------------------------------------------------------------------------
// Auto-sync settings
// ---------------------------------------------------------------------------

/// Persisted part of the auto-sync state. `running` is deliberately absent:
/// it is process-local.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSyncSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Fingerprint polling interval; `0` disables polling.
    #[serde(default = "AutoSyncSettings::default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "AutoSyncSettings::default_debounce_ms")]
    pub debounce_ms: u64,
    /// Destination whitelist. Empty means every registered destination.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<String>,
    /// Destination blacklist, applied after the whitelist.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl AutoSyncSettings {
    pub const DEFAULT_INTERVAL_MS: u64 = 60_000;
    pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

    fn default_interval_ms() -> u64 {
        Self::DEFAULT_INTERVAL_MS
    }

    fn default_debounce_ms() -> u64 {
        Self::DEFAULT_DEBOUNCE_MS
    }

    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ms > 0).then(|| Duration::from_millis(self.interval_ms))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Default for AutoSyncSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: Self::DEFAULT_INTERVAL_MS,
            debounce_ms: Self::DEFAULT_DEBOUNCE_MS,
            destinations: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config document
// ---------------------------------------------------------------------------

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMetadata {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_sync: Option<AutoSyncSettings>,
}

impl Default for ConfigMetadata {
    fn default() -> Self {
        Self {
            version: default_version(),
            updated_at: None,
            auto_sync: None,
        }
    }
}

/// Root of the persisted configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub servers: BTreeMap<ServerName, ServerConfig>,
    #[serde(default)]
    pub metadata: ConfigMetadata,
}

impl Config {
    pub fn get(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.get(&ServerName::from(name))
    }

    /// Enabled servers routed to `destination`, keyed by name.
    pub fn servers_for(&self, destination: &str) -> BTreeMap<ServerName, ServerConfig> {
        self.servers
            .iter()
            .filter(|(_, server)| server.routes_to(destination))
            .map(|(name, server)| (name.clone(), server.clone()))
            .collect()
    }

    pub fn enabled_count(&self) -> usize {
        self.servers.values().filter(|s| s.enabled).count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ServerName::from("github").to_string(), "github");
    }

    #[test]
    fn stdio_record_yaml_roundtrip() {
        let mut config = Config::default();
        let mut server = ServerConfig::new(Transport::Stdio {
            command: "npx".into(),
            args: vec!["-y".into(), "server-github".into()],
            env: BTreeMap::from([("TOKEN".to_string(), "x".to_string())]),
        });
        server.exclude_destinations.push("editor".into());
        config.servers.insert(ServerName::from("github"), server);

        let yaml = serde_yaml::to_string(&config).expect("serialize");
        assert!(yaml.contains("transport: stdio"), "got: {yaml}");
        let back: Config = serde_yaml::from_str(&yaml).expect("deserialize");
        assert_eq!(back, config);
    }

    #[test]
    fn remote_transport_accepts_aliases() {
        for tag in ["http", "sse", "streamable-http"] {
            let json = format!(r#"{{"transport":"{tag}","url":"https://example.test/mcp"}}"#);
            let server: ServerConfig = serde_json::from_str(&json).expect("parse");
            assert_eq!(server.transport.kind(), TransportKind::Http);
            assert!(server.enabled, "enabled defaults to true");
        }
    }

    #[test]
    fn stdio_fields_rejected_without_command() {
        let err = serde_json::from_str::<ServerConfig>(r#"{"transport":"stdio","url":"x"}"#);
        assert!(err.is_err(), "stdio record must carry a command");
    }

    #[test]
    fn routing_honours_enabled_include_and_exclude() {
        let mut server = ServerConfig::new(Transport::stdio("x"));
        assert!(server.routes_to("a"));

        server.include_destinations = vec!["a".into()];
        assert!(server.routes_to("a"));
        assert!(!server.routes_to("b"));

        server.exclude_destinations = vec!["a".into()];
        assert!(!server.routes_to("a"));

        server.include_destinations.clear();
        server.exclude_destinations.clear();
        server.enabled = false;
        assert!(!server.routes_to("a"));
    }

    #[test]
    fn same_content_ignores_bookkeeping() {
        let a = ServerConfig::new(Transport::stdio("x")).with_source("api");
        let mut b = a.clone();
        b.modified_at = a.modified_at + chrono::Duration::hours(1);
        b.source = Some("import".into());
        assert!(a.same_content(&b));

        b.transport = Transport::stdio("y");
        assert!(!a.same_content(&b));
    }

    #[test]
    fn auto_sync_interval_zero_disables_polling() {
        let settings = AutoSyncSettings {
            interval_ms: 0,
            ..AutoSyncSettings::default()
        };
        assert!(settings.interval().is_none());
        assert_eq!(settings.debounce(), Duration::from_millis(500));
    }
}
