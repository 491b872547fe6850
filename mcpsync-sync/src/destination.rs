//! The sync-target contract.

use std::collections::BTreeMap;
use std::path::PathBuf;

use mcpsync_core::{ServerConfig, ServerName};

use crate::error::DestinationError;

/// A destination's native per-server entries, keyed by server name.
pub type ServerEntries = BTreeMap<String, serde_json::Value>;

/// A place server records are synced to (a tool's config file, an API, ...).
///
/// Implementations are called from blocking worker threads; one destination
/// sees its operations strictly in sequence (transform → backup → read →
/// write) but different destinations run concurrently.
pub trait Destination: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &str;

    fn description(&self) -> String;

    /// Map the routed servers onto the destination's native entries.
    fn transform(
        &self,
        servers: &BTreeMap<ServerName, ServerConfig>,
    ) -> Result<ServerEntries, DestinationError>;

    /// Current entries, or `None` when the destination has no content yet.
    fn read(&self) -> Result<Option<ServerEntries>, DestinationError>;

    fn write(&self, entries: &ServerEntries) -> Result<(), DestinationError>;

    fn exists(&self) -> bool;

    fn supports_backup(&self) -> bool {
        false
    }

    /// Copy the current content aside; returns where it went.
    fn backup(&self) -> Result<PathBuf, DestinationError> {
        Err(DestinationError::BackupUnsupported {
            id: self.id().to_string(),
        })
    }
}
