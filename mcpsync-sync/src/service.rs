//! Facade tying the config store, the destination registry and the event
//! bus together for long-lived hosts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use mcpsync_core::{ConfigStore, EventBus, EventKind};

use crate::destination::Destination;
use crate::error::SyncError;
use crate::file_destination::{FileDestinationSpec, JsonFileDestination};
use crate::orchestrator::{self, DestinationLocks};
use crate::registry::DestinationRegistry;
use crate::result::{MultiSyncResult, SyncOptions, SyncResult};
use crate::syncer;

/// A dry-run result plus the rendered text diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPreview {
    pub result: SyncResult,
    pub diff: String,
}

#[derive(Clone)]
pub struct SyncService {
    store: Arc<ConfigStore>,
    destinations: Arc<DestinationRegistry>,
    locks: Arc<DestinationLocks>,
}

impl SyncService {
    pub fn new(store: Arc<ConfigStore>, destinations: Arc<DestinationRegistry>) -> Self {
        Self {
            store,
            destinations,
            locks: Arc::new(DestinationLocks::new()),
        }
    }

    pub fn store(&self) -> &Arc<ConfigStore> {
        &self.store
    }

    pub fn destinations(&self) -> &Arc<DestinationRegistry> {
        &self.destinations
    }

    pub fn events(&self) -> &EventBus {
        self.store.events()
    }

    pub fn register_file_destination(&self, spec: FileDestinationSpec) -> Result<(), SyncError> {
        self.destinations
            .register(Arc::new(JsonFileDestination::from_spec(spec)))
    }

    pub async fn sync_to(&self, id: &str, options: SyncOptions) -> Result<SyncResult, SyncError> {
        let destination = self.destinations.get(id)?;
        let mut multi = self.sync_destinations(vec![destination], options, None).await?;
        multi
            .results
            .pop()
            .ok_or_else(|| SyncError::UnknownDestination(id.to_string()))
    }

    /// Unbounded fan-out to the named destinations. Repeated ids are synced
    /// once; unknown ids come back as failed results next to the others.
    pub async fn sync_to_multiple(
        &self,
        ids: &[String],
        options: SyncOptions,
    ) -> Result<MultiSyncResult, SyncError> {
        let started = Instant::now();
        let mut seen = HashSet::new();
        let ids: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        let (destinations, unknown) = self.destinations.lookup(&ids);
        if destinations.is_empty() && unknown.is_empty() {
            return Err(SyncError::NoDestinations);
        }

        let mut results = Vec::with_capacity(ids.len());
        if !destinations.is_empty() {
            let multi = self.sync_destinations(destinations, options, None).await?;
            results.extend(multi.results);
        }
        for id in unknown {
            let error = SyncError::UnknownDestination(id.clone()).to_string();
            self.events().publish(EventKind::SyncFailed {
                destination: id.clone(),
                error: error.clone(),
            });
            results.push(SyncResult::failed(&id, options.dry_run, error));
        }
        Ok(MultiSyncResult::from_results(results, started.elapsed()))
    }

    /// Every registered destination, at most `concurrency` at a time.
    pub async fn sync_all(
        &self,
        options: SyncOptions,
        concurrency: usize,
    ) -> Result<MultiSyncResult, SyncError> {
        self.sync_destinations(self.destinations.all(), options, Some(concurrency))
            .await
    }

    /// Run the orchestrator against a config snapshot and publish sync events.
    pub async fn sync_destinations(
        &self,
        destinations: Vec<Arc<dyn Destination>>,
        options: SyncOptions,
        concurrency: Option<usize>,
    ) -> Result<MultiSyncResult, SyncError> {
        if destinations.is_empty() {
            return Err(SyncError::NoDestinations);
        }
        let events = self.events();
        for destination in &destinations {
            events.publish(EventKind::SyncStarted {
                destination: destination.id().to_string(),
                dry_run: options.dry_run,
            });
        }

        let config = Arc::new(self.store.get());
        let multi = orchestrator::sync_to_multiple_locked(
            destinations,
            config,
            options,
            concurrency,
            Arc::clone(&self.locks),
        )
        .await?;

        for result in &multi.results {
            let kind = match result.fatal_error() {
                None => EventKind::SyncCompleted {
                    destination: result.destination.clone(),
                    changes: result.changes.len(),
                    dry_run: result.dry_run,
                    duration_ms: result.duration_ms,
                },
                Some(error) => EventKind::SyncFailed {
                    destination: result.destination.clone(),
                    error: error.to_string(),
                },
            };
            events.publish(kind);
        }
        tracing::info!(
            "sync finished: {} succeeded, {} failed in {}ms",
            multi.success_count,
            multi.failure_count,
            multi.duration_ms
        );
        Ok(multi)
    }

    /// Dry-run with diffs. An empty id list previews every destination.
    pub async fn preview(&self, ids: &[String]) -> Result<Vec<SyncPreview>, SyncError> {
        let destinations = if ids.is_empty() {
            self.destinations.all()
        } else {
            self.destinations.resolve(ids)?
        };
        if destinations.is_empty() {
            return Err(SyncError::NoDestinations);
        }

        let config = Arc::new(self.store.get());
        let mut previews = Vec::with_capacity(destinations.len());
        for destination in destinations {
            let id = destination.id().to_string();
            let config = Arc::clone(&config);
            let preview =
                tokio::task::spawn_blocking(move || syncer::preview(destination.as_ref(), &config))
                    .await;
            previews.push(match preview {
                Ok((result, diff)) => SyncPreview { result, diff },
                Err(e) => SyncPreview {
                    result: SyncResult::failed(&id, true, format!("preview task failed: {e}")),
                    diff: String::new(),
                },
            });
        }
        Ok(previews)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syncer::testing::MemoryDestination;
    use mcpsync_core::{EventCategory, MemoryStorage, ServerConfig, Transport};

    fn service() -> SyncService {
        let store = Arc::new(ConfigStore::new(Arc::new(MemoryStorage::new()), EventBus::new()));
        store
            .add_server("a", ServerConfig::new(Transport::stdio("x")))
            .unwrap();
        SyncService::new(store, Arc::new(DestinationRegistry::new()))
    }

    #[tokio::test]
    async fn sync_publishes_started_and_completed() {
        let service = service();
        service
            .destinations()
            .register(Arc::new(MemoryDestination::new("d")))
            .unwrap();
        let mut sub = service.events().subscribe_to([EventCategory::Sync]);

        let result = service.sync_to("d", SyncOptions::default()).await.unwrap();
        assert!(result.success);

        let kinds: Vec<_> = sub.drain().into_iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::SyncStarted {
                    destination: "d".into(),
                    dry_run: false
                },
                EventKind::SyncCompleted {
                    destination: "d".into(),
                    changes: 1,
                    dry_run: false,
                    duration_ms: result.duration_ms,
                },
            ]
        );
    }

    #[tokio::test]
    async fn failed_destination_publishes_sync_failed() {
        let service = service();
        service
            .destinations()
            .register(Arc::new(MemoryDestination {
                fail_write: true,
                ..MemoryDestination::new("broken")
            }))
            .unwrap();
        let mut sub = service.events().subscribe_to([EventCategory::Sync]);

        let multi = service
            .sync_to_multiple(&["broken".to_string()], SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(multi.failure_count, 1);
        assert!(sub
            .drain()
            .iter()
            .any(|e| matches!(&e.kind, EventKind::SyncFailed { destination, .. } if destination == "broken")));
    }

    #[tokio::test]
    async fn unknown_destination_is_reported() {
        let service = service();
        let err = service
            .sync_to("nope", SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownDestination(_)));
    }

    #[tokio::test]
    async fn sync_all_without_destinations_is_an_error() {
        let err = service()
            .sync_all(SyncOptions::default(), 4)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NoDestinations));
    }

    #[tokio::test]
    async fn preview_covers_all_destinations_and_writes_nothing() {
        let service = service();
        let d1 = Arc::new(MemoryDestination::new("d1"));
        service.destinations().register(d1.clone()).unwrap();
        service
            .destinations()
            .register(Arc::new(MemoryDestination::new("d2")))
            .unwrap();

        let previews = service.preview(&[]).await.unwrap();
        assert_eq!(previews.len(), 2);
        assert!(previews.iter().all(|p| p.result.dry_run && !p.diff.is_empty()));
        assert!(d1.content().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_ids_fail_alone_and_duplicates_sync_once() {
        let service = service();
        let known = Arc::new(MemoryDestination::new("known"));
        service.destinations().register(known.clone()).unwrap();

        let ids: Vec<String> = ["known", "ghost", "known"].iter().map(|s| s.to_string()).collect();
        let multi = service
            .sync_to_multiple(&ids, SyncOptions::default())
            .await
            .unwrap();

        assert_eq!(multi.results.len(), 2);
        assert_eq!(multi.success_count, 1);
        assert_eq!(multi.failure_count, 1);
        assert!(multi.get("known").unwrap().success);
        let ghost = multi.get("ghost").unwrap();
        assert!(!ghost.success);
        assert!(ghost.fatal_error().unwrap().contains("ghost"));
        assert_eq!(*known.writes.lock(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_for_one_file_destination_all_succeed() {
        let dir = tempfile::TempDir::new().unwrap();
        let service = service();
        service
            .register_file_destination(FileDestinationSpec {
                id: "a".into(),
                path: dir.path().join("a.json"),
                servers_key: crate::file_destination::DEFAULT_SERVERS_KEY.into(),
                description: None,
            })
            .unwrap();
        let ids = vec!["a".to_string(), "a".to_string()];

        for round in 0..50 {
            let (single, multi) = tokio::join!(
                service.sync_to("a", SyncOptions::default()),
                service.sync_to_multiple(&ids, SyncOptions::default()),
            );
            assert!(single.unwrap().success, "round {round}");
            let multi = multi.unwrap();
            assert_eq!(multi.results.len(), 1, "round {round}");
            assert!(multi.all_succeeded(), "round {round}: {:?}", multi.results);

            service
                .store()
                .update_server("a", ServerConfig::new(Transport::stdio(format!("x{round}"))))
                .unwrap();
        }
    }
}
