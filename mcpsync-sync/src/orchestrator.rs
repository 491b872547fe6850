//! Concurrent fan-out of one sync request to many destinations.
//!
//! One tokio task per destination; the destination work itself runs on the
//! blocking pool. Results are collected by the calling task alone, so the
//! aggregate needs no shared lock. A destination that panics still yields a
//! failed [`SyncResult`].
//!
//! Syncs of the same destination never overlap: each destination id owns an
//! async lock in [`DestinationLocks`], and duplicate ids in one request are
//! synced once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;

use mcpsync_core::Config;

use crate::destination::Destination;
use crate::error::SyncError;
use crate::result::{MultiSyncResult, SyncOptions, SyncResult};
use crate::syncer;

/// Sync `config` into every destination concurrently.
///
/// `concurrency` caps the number of destinations in flight; `None` is
/// unbounded. An empty destination list is an error.
pub async fn sync_to_multiple(
    destinations: Vec<Arc<dyn Destination>>,
    config: Arc<Config>,
    options: SyncOptions,
    concurrency: Option<usize>,
) -> Result<MultiSyncResult, SyncError> {
    let locks = Arc::new(DestinationLocks::new());
    sync_to_multiple_locked(destinations, config, options, concurrency, locks).await
}

/// Per-destination locks shared by every sync issued through one host.
#[derive(Debug, Default)]
pub struct DestinationLocks {
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl DestinationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks.lock().entry(id.to_string()).or_default())
    }
}

/// [`sync_to_multiple`] serialized per destination through `locks`.
pub async fn sync_to_multiple_locked(
    destinations: Vec<Arc<dyn Destination>>,
    config: Arc<Config>,
    options: SyncOptions,
    concurrency: Option<usize>,
    locks: Arc<DestinationLocks>,
) -> Result<MultiSyncResult, SyncError> {
    let destinations = dedupe(destinations);
    if destinations.is_empty() {
        return Err(SyncError::NoDestinations);
    }
    let started = Instant::now();
    let limiter = concurrency.map(|n| Arc::new(Semaphore::new(n.max(1))));

    let handles: Vec<(String, JoinHandle<SyncResult>)> = destinations
        .into_iter()
        .map(|destination| {
            let id = destination.id().to_string();
            let config = Arc::clone(&config);
            let limiter = limiter.clone();
            let lane = locks.lock_for(&id);
            let handle = tokio::spawn(async move {
                // Take the destination lock before a permit so waiting on a
                // busy destination does not hold a concurrency slot.
                let _lane = lane.lock_owned().await;
                let _permit = match limiter {
                    Some(sem) => match sem.acquire_owned().await {
                        Ok(permit) => Some(permit),
                        Err(_) => None,
                    },
                    None => None,
                };
                let task_id = destination.id().to_string();
                let blocking = tokio::task::spawn_blocking(move || {
                    syncer::sync_to(destination.as_ref(), &config, &options)
                });
                match blocking.await {
                    Ok(result) => result,
                    Err(e) => SyncResult::failed(&task_id, options.dry_run, panic_message(e)),
                }
            });
            (id, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (id, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => SyncResult::failed(&id, options.dry_run, panic_message(e)),
        };
        if result.success {
            tracing::debug!("{id}: synced");
        } else {
            tracing::warn!("{id}: sync failed: {}", result.fatal_error().unwrap_or("unknown error"));
        }
        results.push(result);
    }

    Ok(MultiSyncResult::from_results(results, started.elapsed()))
}

/// Keep the first destination for each id.
fn dedupe(destinations: Vec<Arc<dyn Destination>>) -> Vec<Arc<dyn Destination>> {
    let mut seen = HashSet::new();
    destinations
        .into_iter()
        .filter(|d| seen.insert(d.id().to_string()))
        .collect()
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "sync task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            format!("sync panicked: {detail}")
        }
        Err(e) => format!("sync task failed: {e}"),
    }
}
