//! Name → destination map, guarded independently of the config lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::destination::Destination;
use crate::error::SyncError;

/// Public summary of a registered destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationInfo {
    pub id: String,
    pub description: String,
}

#[derive(Default)]
pub struct DestinationRegistry {
    destinations: RwLock<BTreeMap<String, Arc<dyn Destination>>>,
}

impl DestinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, destination: Arc<dyn Destination>) -> Result<(), SyncError> {
        let id = destination.id().to_string();
        let mut guard = self.destinations.write();
        if guard.contains_key(&id) {
            return Err(SyncError::DestinationExists(id));
        }
        tracing::debug!("registered destination {id}");
        guard.insert(id, destination);
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Arc<dyn Destination>, SyncError> {
        self.destinations
            .write()
            .remove(id)
            .ok_or_else(|| SyncError::UnknownDestination(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Destination>, SyncError> {
        self.destinations
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownDestination(id.to_string()))
    }

    pub fn info(&self, id: &str) -> Result<DestinationInfo, SyncError> {
        let destination = self.get(id)?;
        Ok(DestinationInfo {
            id: destination.id().to_string(),
            description: destination.description(),
        })
    }

    /// Sorted by id.
    pub fn list(&self) -> Vec<DestinationInfo> {
        self.destinations
            .read()
            .values()
            .map(|d| DestinationInfo {
                id: d.id().to_string(),
                description: d.description(),
            })
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.destinations.read().keys().cloned().collect()
    }

    /// Look up every id; the first unknown one fails the whole call.
    pub fn resolve(&self, ids: &[String]) -> Result<Vec<Arc<dyn Destination>>, SyncError> {
        let guard = self.destinations.read();
        ids.iter()
            .map(|id| {
                guard
                    .get(id)
                    .cloned()
                    .ok_or_else(|| SyncError::UnknownDestination(id.clone()))
            })
            .collect()
    }

    /// Split `ids` into registered destinations and the ids nobody registered.
    pub fn lookup(&self, ids: &[String]) -> (Vec<Arc<dyn Destination>>, Vec<String>) {
        let guard = self.destinations.read();
        let mut found = Vec::with_capacity(ids.len());
        let mut unknown = Vec::new();
        for id in ids {
            match guard.get(id) {
                Some(destination) => found.push(Arc::clone(destination)),
                None => unknown.push(id.clone()),
            }
        }
        (found, unknown)
    }

    pub fn all(&self) -> Vec<Arc<dyn Destination>> {
        self.destinations.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.destinations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.read().is_empty()
    }
}
