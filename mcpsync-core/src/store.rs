//! The live configuration, guarded by a single read/write lock.
//!
//! Every mutation clones the current config, applies the change, persists
//! the result through the injected [`Storage`] and only then swaps it in;
//! all while holding the write lock. A failed persist leaves the in-memory
//! config untouched.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::StoreError;
use crate::events::{EventBus, EventKind};
use crate::storage::Storage;
use crate::types::{AutoSyncSettings, Config, ServerConfig, ServerName};
use crate::validate::{BasicValidator, NameSanitizer, ServerValidator, TrimSanitizer};

/// Storage key of the config blob.
pub const CONFIG_KEY: &str = "servers.yaml";

/// Outcome of [`ConfigStore::merge`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub added: Vec<ServerName>,
    /// Names present on both sides with different content; the incoming
    /// record won.
    pub conflicts: Vec<ServerName>,
    pub unchanged: usize,
}

pub struct ConfigStore {
    config: RwLock<Config>,
    storage: Arc<dyn Storage>,
    key: String,
    events: EventBus,
    validators: Vec<Box<dyn ServerValidator>>,
    sanitizer: Box<dyn NameSanitizer>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("storage", &self.storage.describe())
            .field("key", &self.key)
            .finish()
    }
}

impl ConfigStore {
    /// Empty store backed by `storage`; call [`load`](Self::load) to populate.
    pub fn new(storage: Arc<dyn Storage>, events: EventBus) -> Self {
        Self {
            config: RwLock::new(Config::default()),
            storage,
            key: CONFIG_KEY.to_string(),
            events,
            validators: vec![Box::new(BasicValidator)],
            sanitizer: Box::new(TrimSanitizer),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_validator(mut self, validator: impl ServerValidator + 'static) -> Self {
        self.validators.push(Box::new(validator));
        self
    }

    pub fn with_sanitizer(mut self, sanitizer: impl NameSanitizer + 'static) -> Self {
        self.sanitizer = Box::new(sanitizer);
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn storage_description(&self) -> String {
        self.storage.describe()
    }

    /// Path a change watcher should observe, if the backend is file-based.
    pub fn watch_path(&self) -> Option<PathBuf> {
        self.storage.watch_path(&self.key)
    }

    // -----------------------------------------------------------------------
    // Load / reload
    // -----------------------------------------------------------------------

    /// Replace the in-memory config with the persisted one. A missing blob
    /// yields an empty config. Returns the number of servers loaded.
    pub fn load(&self) -> Result<usize, StoreError> {
        let servers = {
            let mut guard = self.config.write();
            let loaded = self.read_persisted()?;
            let servers = loaded.servers.len();
            *guard = loaded;
            servers
        };
        self.events.publish(EventKind::ConfigLoaded { servers });
        Ok(servers)
    }

    /// Like [`load`](Self::load) but reports whether anything changed.
    pub fn reload(&self) -> Result<bool, StoreError> {
        // Read under the write lock so a concurrent mutation cannot land
        // between the read and the swap.
        let (changed, servers) = {
            let mut guard = self.config.write();
            let loaded = self.read_persisted()?;
            let servers = loaded.servers.len();
            let changed = *guard != loaded;
            *guard = loaded;
            (changed, servers)
        };
        self.events.publish(EventKind::ConfigLoaded { servers });
        Ok(changed)
    }

    fn read_persisted(&self) -> Result<Config, StoreError> {
        match self.storage.read(&self.key)? {
            None => Ok(Config::default()),
            Some(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Config::default()),
            Some(bytes) => serde_yaml::from_slice(&bytes).map_err(|source| StoreError::Parse {
                key: self.key.clone(),
                source,
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Whole-config access
    // -----------------------------------------------------------------------

    /// Snapshot of the current config.
    pub fn get(&self) -> Config {
        self.config.read().clone()
    }

    /// Replace the whole config (validated record by record) and persist it.
    pub fn set(&self, config: Config) -> Result<(), StoreError> {
        for (name, server) in &config.servers {
            self.validate(name, server)?;
        }
        self.mutate(move |current| {
            *current = config;
            Ok(())
        })
    }

    /// Apply `f` to a copy of the config, persist, then publish the copy.
    pub fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Config) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let (out, servers) = {
            let mut guard = self.config.write();
            let mut next = guard.clone();
            let out = f(&mut next)?;
            next.metadata.updated_at = Some(Utc::now());
            self.persist(&next)?;
            let servers = next.servers.len();
            *guard = next;
            (out, servers)
        };
        self.events.publish(EventKind::ConfigSaved { servers });
        Ok(out)
    }

    fn persist(&self, config: &Config) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(config)?;
        self.storage.write(&self.key, yaml.as_bytes())?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Server operations
    // -----------------------------------------------------------------------

    pub fn get_server(&self, name: &str) -> Option<ServerConfig> {
        let name = ServerName::from(self.sanitizer.sanitize(name));
        self.config.read().servers.get(&name).cloned()
    }

    pub fn list_servers(&self) -> Vec<(ServerName, ServerConfig)> {
        self.config
            .read()
            .servers
            .iter()
            .map(|(name, server)| (name.clone(), server.clone()))
            .collect()
    }

    pub fn server_count(&self) -> usize {
        self.config.read().servers.len()
    }

    /// Add a new server; fails if the (sanitized) name is taken.
    pub fn add_server(&self, name: &str, mut server: ServerConfig) -> Result<ServerName, StoreError> {
        let name = ServerName::from(self.sanitizer.sanitize(name));
        self.validate(&name, &server)?;
        server.modified_at = Utc::now();

        let key = name.clone();
        self.mutate(move |config| {
            if config.servers.contains_key(&key) {
                return Err(StoreError::ServerExists { name: key.0 });
            }
            config.servers.insert(key, server);
            Ok(())
        })?;
        self.events.publish(EventKind::ServerAdded { name: name.clone() });
        Ok(name)
    }

    /// Replace an existing server record.
    pub fn update_server(&self, name: &str, mut server: ServerConfig) -> Result<(), StoreError> {
        let name = ServerName::from(self.sanitizer.sanitize(name));
        self.validate(&name, &server)?;
        server.modified_at = Utc::now();

        let key = name.clone();
        self.mutate(move |config| match config.servers.get_mut(&key) {
            Some(slot) => {
                *slot = server;
                Ok(())
            }
            None => Err(StoreError::ServerNotFound { name: key.0 }),
        })?;
        self.events.publish(EventKind::ServerUpdated { name });
        Ok(())
    }

    pub fn remove_server(&self, name: &str) -> Result<ServerConfig, StoreError> {
        let name = ServerName::from(self.sanitizer.sanitize(name));
        let key = name.clone();
        let removed = self.mutate(move |config| {
            config
                .servers
                .remove(&key)
                .ok_or(StoreError::ServerNotFound { name: key.0 })
        })?;
        self.events.publish(EventKind::ServerRemoved { name });
        Ok(removed)
    }

    /// Import `incoming` servers. Last write wins: on a name clash with
    /// different content the incoming record replaces the stored one and a
    /// `ConflictDetected` event is emitted.
    pub fn merge(&self, incoming: Config, source: &str) -> Result<MergeReport, StoreError> {
        let mut prepared = Vec::with_capacity(incoming.servers.len());
        for (name, mut server) in incoming.servers {
            let name = ServerName::from(self.sanitizer.sanitize(name.as_str()));
            self.validate(&name, &server)?;
            server.source = Some(source.to_string());
            server.modified_at = Utc::now();
            prepared.push((name, server));
        }

        let report = self.mutate(move |config| {
            let mut report = MergeReport::default();
            for (name, server) in prepared {
                match config.servers.get(&name) {
                    None => report.added.push(name.clone()),
                    Some(existing) if existing.same_content(&server) => {
                        report.unchanged += 1;
                        continue;
                    }
                    Some(_) => report.conflicts.push(name.clone()),
                }
                config.servers.insert(name, server);
            }
            Ok(report)
        })?;

        for name in &report.added {
            self.events
                .publish(EventKind::ServerAdded { name: name.clone() });
        }
        for name in &report.conflicts {
            tracing::info!(server = %name, source, "merge conflict resolved, incoming record wins");
            self.events.publish(EventKind::ConflictDetected {
                server: name.clone(),
                resolution: "incoming_wins".to_string(),
            });
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Auto-sync settings
    // -----------------------------------------------------------------------

    pub fn auto_sync_settings(&self) -> Option<AutoSyncSettings> {
        self.config.read().metadata.auto_sync.clone()
    }

    pub fn set_auto_sync_settings(&self, settings: AutoSyncSettings) -> Result<(), StoreError> {
        self.mutate(move |config| {
            config.metadata.auto_sync = Some(settings);
            Ok(())
        })
    }

    fn validate(&self, name: &ServerName, server: &ServerConfig) -> Result<(), StoreError> {
        for validator in &self.validators {
            validator
                .validate(name, server)
                .map_err(|reason| StoreError::Validation {
                    name: name.0.clone(),
                    reason,
                })?;
        }
        Ok(())
    }
}
