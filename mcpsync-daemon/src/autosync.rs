//! Auto-sync coordinator.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`. While
//! running, one background loop owns the [`ChangeWatcher`] and a
//! [`Debouncer`]; when the debounce timer fires it reloads the config source
//! and syncs the selected destinations. Enabled/interval/debounce/destination
//! lists are persisted in the config store; the running flag is not.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use mcpsync_core::{AutoSyncSettings, EventKind, StoreError};
use mcpsync_sync::{SyncOptions, SyncService};

use crate::config::DEFAULT_SYNC_CONCURRENCY;
use crate::debounce::Debouncer;
use crate::error::AutoSyncError;
use crate::watcher::ChangeWatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoSyncPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl AutoSyncPhase {
    pub fn label(self) -> &'static str {
        match self {
            AutoSyncPhase::Stopped => "stopped",
            AutoSyncPhase::Starting => "starting",
            AutoSyncPhase::Running => "running",
            AutoSyncPhase::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSyncStatus {
    pub phase: AutoSyncPhase,
    /// Persisted flag; survives restarts.
    pub enabled: bool,
    /// Process-local.
    pub running: bool,
    pub interval_ms: u64,
    pub debounce_ms: u64,
    pub destinations: Vec<String>,
    pub exclude: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_count: u64,
    pub watching: Option<PathBuf>,
}

struct Shared {
    phase: AutoSyncPhase,
    settings: AutoSyncSettings,
    last_sync: Option<DateTime<Utc>>,
    sync_count: u64,
    watching: Option<PathBuf>,
}

struct LoopHandle {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct AutoSyncCoordinator {
    service: SyncService,
    ignore: Vec<String>,
    concurrency: usize,
    shared: Arc<Mutex<Shared>>,
    handle: Mutex<Option<LoopHandle>>,
}

impl AutoSyncCoordinator {
    pub fn new(service: SyncService) -> Self {
        let settings = service.store().auto_sync_settings().unwrap_or_default();
        Self {
            service,
            ignore: Vec::new(),
            concurrency: DEFAULT_SYNC_CONCURRENCY,
            shared: Arc::new(Mutex::new(Shared {
                phase: AutoSyncPhase::Stopped,
                settings,
                last_sync: None,
                sync_count: 0,
                watching: None,
            })),
            handle: Mutex::new(None),
        }
    }

    /// Extra ignore globs for the change watcher.
    pub fn with_ignore(mut self, ignore: Vec<String>) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn phase(&self) -> AutoSyncPhase {
        self.shared.lock().phase
    }

    /// Anything other than fully stopped counts as running.
    pub fn is_running(&self) -> bool {
        self.phase() != AutoSyncPhase::Stopped
    }

    pub fn status(&self) -> AutoSyncStatus {
        let enabled = self
            .service
            .store()
            .auto_sync_settings()
            .map_or(false, |s| s.enabled);
        let shared = self.shared.lock();
        AutoSyncStatus {
            phase: shared.phase,
            enabled,
            running: shared.phase == AutoSyncPhase::Running,
            interval_ms: shared.settings.interval_ms,
            debounce_ms: shared.settings.debounce_ms,
            destinations: shared.settings.destinations.clone(),
            exclude: shared.settings.exclude.clone(),
            last_sync: shared.last_sync,
            sync_count: shared.sync_count,
            watching: shared.watching.clone(),
        }
    }

    /// Settings a start without explicit settings would use.
    pub fn persisted_or_default(&self) -> AutoSyncSettings {
        self.service.store().auto_sync_settings().unwrap_or_default()
    }

    pub async fn start(&self, settings: AutoSyncSettings) -> Result<AutoSyncStatus, AutoSyncError> {
        {
            let mut shared = self.shared.lock();
            match shared.phase {
                AutoSyncPhase::Stopped => shared.phase = AutoSyncPhase::Starting,
                AutoSyncPhase::Starting | AutoSyncPhase::Running => {
                    return Err(AutoSyncError::AlreadyRunning)
                }
                AutoSyncPhase::Stopping => {
                    return Err(AutoSyncError::Transitioning(AutoSyncPhase::Stopping.label()))
                }
            }
        }

        if let Err(err) = self.launch(settings) {
            self.shared.lock().phase = AutoSyncPhase::Stopped;
            tracing::warn!(error = %err, "auto-sync failed to start");
            return Err(err);
        }
        Ok(self.status())
    }

    fn launch(&self, mut settings: AutoSyncSettings) -> Result<(), AutoSyncError> {
        let store = self.service.store();
        let path = store
            .watch_path()
            .ok_or_else(|| AutoSyncError::Unwatchable(store.storage_description()))?;

        // Persist before watching so our own write is not seen as a change.
        settings.enabled = true;
        store.set_auto_sync_settings(settings.clone())?;

        let watcher = match ChangeWatcher::watch(&path, &self.ignore) {
            Ok(watcher) => watcher,
            Err(err) => {
                if let Err(revert) = self.persist_disabled() {
                    tracing::warn!(error = %revert, "could not revert auto-sync enabled flag");
                }
                return Err(err.into());
            }
        };

        let (stop, stop_rx) = oneshot::channel();
        let ctx = LoopContext {
            service: self.service.clone(),
            shared: Arc::clone(&self.shared),
            settings: settings.clone(),
            concurrency: self.concurrency,
        };
        let task = tokio::spawn(run_loop(ctx, watcher, stop_rx));
        *self.handle.lock() = Some(LoopHandle { stop, task });

        let event = EventKind::AutoSyncStarted {
            debounce_ms: settings.debounce_ms,
            destinations: settings.destinations.clone(),
        };
        {
            let mut shared = self.shared.lock();
            shared.settings = settings;
            shared.watching = Some(path.clone());
            shared.phase = AutoSyncPhase::Running;
        }
        tracing::info!(path = %path.display(), "auto-sync started");
        self.service.events().publish(event);
        Ok(())
    }

    /// Stop and persist `enabled = false`; other settings are kept for the
    /// next start.
    pub async fn stop(&self) -> Result<AutoSyncStatus, AutoSyncError> {
        self.halt(true).await?;
        Ok(self.status())
    }

    /// Stop for process shutdown: the persisted flag is left alone so the
    /// next daemon resumes. A no-op when not running.
    pub async fn shutdown(&self) {
        match self.halt(false).await {
            Ok(()) | Err(AutoSyncError::NotRunning) => {}
            Err(err) => tracing::warn!(error = %err, "auto-sync shutdown failed"),
        }
    }

    async fn halt(&self, persist: bool) -> Result<(), AutoSyncError> {
        {
            let mut shared = self.shared.lock();
            match shared.phase {
                AutoSyncPhase::Running => shared.phase = AutoSyncPhase::Stopping,
                AutoSyncPhase::Stopped => return Err(AutoSyncError::NotRunning),
                other => return Err(AutoSyncError::Transitioning(other.label())),
            }
        }

        let handle = self.handle.lock().take();
        if let Some(LoopHandle { stop, task }) = handle {
            let _ = stop.send(());
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "auto-sync loop ended abnormally");
            }
        }

        let persisted = if persist {
            self.persist_disabled()
        } else {
            Ok(())
        };
        {
            let mut shared = self.shared.lock();
            shared.phase = AutoSyncPhase::Stopped;
            shared.watching = None;
        }
        tracing::info!("auto-sync stopped");
        self.service.events().publish(EventKind::AutoSyncStopped);
        persisted?;
        Ok(())
    }

    fn persist_disabled(&self) -> Result<(), StoreError> {
        let store = self.service.store();
        let mut settings = store
            .auto_sync_settings()
            .unwrap_or_else(|| self.shared.lock().settings.clone());
        settings.enabled = false;
        store.set_auto_sync_settings(settings)
    }

    /// If the persisted settings say enabled, wait `delay` then start with
    /// them. Returns whether this call started auto-sync; a manual start in
    /// the meantime is not an error.
    pub async fn resume_if_enabled(&self, delay: Duration) -> Result<bool, AutoSyncError> {
        if !self.persisted_enabled() {
            return Ok(false);
        }
        tokio::time::sleep(delay).await;
        let Some(settings) = self
            .service
            .store()
            .auto_sync_settings()
            .filter(|s| s.enabled)
        else {
            return Ok(false);
        };
        match self.start(settings).await {
            Ok(_) => {
                tracing::info!("auto-sync resumed from persisted settings");
                Ok(true)
            }
            Err(AutoSyncError::AlreadyRunning) => {
                tracing::debug!("auto-sync already started before resume");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn persisted_enabled(&self) -> bool {
        self.service
            .store()
            .auto_sync_settings()
            .map_or(false, |s| s.enabled)
    }
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct LoopContext {
    service: SyncService,
    shared: Arc<Mutex<Shared>>,
    settings: AutoSyncSettings,
    concurrency: usize,
}

async fn run_loop(ctx: LoopContext, mut watcher: ChangeWatcher, mut stop_rx: oneshot::Receiver<()>) {
    let path = watcher.path().to_path_buf();
    let mut debouncer = Debouncer::new(ctx.settings.debounce());
    let mut poll = ctx.settings.interval().map(|every| {
        let mut interval = tokio::time::interval_at(Instant::now() + every, every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    let mut last_fingerprint = fingerprint(&path).await;
    let mut in_flight: Option<JoinHandle<()>> = None;
    let mut watcher_open = true;

    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            _ = &mut stop_rx => break,
            change = watcher.recv(), if watcher_open => match change {
                Some(change) => {
                    tracing::debug!(kind = ?change.kind, path = %change.path.display(), "config source changed");
                    last_fingerprint = fingerprint(&path).await;
                    ctx.service.events().publish(EventKind::FileChanged { path: change.path });
                    debouncer.on_change(Instant::now());
                }
                None => {
                    tracing::warn!("change watcher closed; only interval polling remains");
                    watcher_open = false;
                }
            },
            _ = sleep_until_opt(deadline) => {
                if debouncer.poll_fire(Instant::now()) {
                    in_flight = Some(tokio::spawn(run_batch(ctx.clone())));
                }
            }
            joined = join_opt(&mut in_flight) => {
                in_flight = None;
                if let Err(err) = joined {
                    tracing::error!(error = %err, "auto-sync batch panicked");
                    ctx.service.events().publish(EventKind::Error {
                        message: format!("auto-sync batch failed: {err}"),
                    });
                }
                debouncer.on_sync_complete(Instant::now());
            }
            _ = tick_opt(&mut poll) => {
                let current = fingerprint(&path).await;
                if current != last_fingerprint {
                    tracing::debug!(path = %path.display(), "config source fingerprint changed");
                    last_fingerprint = current;
                    ctx.service.events().publish(EventKind::FileChanged { path: path.clone() });
                    debouncer.on_change(Instant::now());
                }
            }
        }
    }

    debouncer.cancel();
    if let Some(task) = in_flight {
        let _ = task.await;
    }
}

/// Reload the source, then sync the selected destinations.
async fn run_batch(ctx: LoopContext) {
    let store = Arc::clone(ctx.service.store());
    match tokio::task::spawn_blocking(move || store.reload()).await {
        Ok(Ok(changed)) => tracing::debug!(changed, "config source reloaded"),
        Ok(Err(err)) => {
            tracing::warn!(error = %err, "config reload failed; auto-sync skipped");
            ctx.service.events().publish(EventKind::Error {
                message: format!("config reload failed: {err}"),
            });
            return;
        }
        Err(err) => {
            tracing::error!(error = %err, "config reload task failed");
            return;
        }
    }

    let registry = ctx.service.destinations();
    let targets = resolve_targets(&ctx.settings, &registry.ids());
    let destinations: Vec<_> = targets
        .iter()
        .filter_map(|id| registry.get(id).ok())
        .collect();

    if destinations.is_empty() {
        tracing::debug!("auto-sync fired with no destinations selected");
    } else {
        match ctx
            .service
            .sync_destinations(destinations, SyncOptions::default(), Some(ctx.concurrency))
            .await
        {
            Ok(multi) => tracing::info!(
                succeeded = multi.success_count,
                failed = multi.failure_count,
                duration_ms = multi.duration_ms,
                "auto-sync batch finished",
            ),
            Err(err) => tracing::warn!(error = %err, "auto-sync batch failed"),
        }
    }

    let mut shared = ctx.shared.lock();
    shared.last_sync = Some(Utc::now());
    shared.sync_count += 1;
}

/// Whitelist (or every registered destination when empty) minus blacklist.
pub(crate) fn resolve_targets(settings: &AutoSyncSettings, registered: &[String]) -> Vec<String> {
    let selected: Vec<String> = if settings.destinations.is_empty() {
        registered.to_vec()
    } else {
        settings
            .destinations
            .iter()
            .filter(|id| {
                let known = registered.contains(id);
                if !known {
                    tracing::warn!(destination = %id, "auto-sync destination is not registered");
                }
                known
            })
            .cloned()
            .collect()
    };
    selected
        .into_iter()
        .filter(|id| !settings.exclude.contains(id))
        .collect()
}

async fn fingerprint(path: &Path) -> Option<String> {
    let bytes = tokio::fs::read(path).await.ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_opt(task: &mut Option<JoinHandle<()>>) -> Result<(), JoinError> {
    match task {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsync_core::{ConfigStore, EventBus, FileStorage, MemoryStorage};
    use mcpsync_sync::DestinationRegistry;
    use tempfile::TempDir;

    fn coordinator(home: &TempDir) -> AutoSyncCoordinator {
        let store = Arc::new(ConfigStore::new(
            Arc::new(FileStorage::new(home.path())),
            EventBus::new(),
        ));
        store.load().unwrap();
        AutoSyncCoordinator::new(SyncService::new(store, Arc::new(DestinationRegistry::new())))
    }

    fn quick() -> AutoSyncSettings {
        AutoSyncSettings {
            interval_ms: 0,
            debounce_ms: 50,
            ..AutoSyncSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_start_is_rejected_without_a_second_watcher() {
        let home = TempDir::new().unwrap();
        let auto = coordinator(&home);

        let status = auto.start(quick()).await.unwrap();
        assert!(status.running);
        assert!(status.enabled);
        assert!(matches!(
            auto.start(quick()).await,
            Err(AutoSyncError::AlreadyRunning)
        ));
        assert!(auto.handle.lock().is_some());

        auto.stop().await.unwrap();
        assert_eq!(auto.phase(), AutoSyncPhase::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_persists_disabled_but_keeps_settings() {
        let home = TempDir::new().unwrap();
        let auto = coordinator(&home);
        let settings = AutoSyncSettings {
            destinations: vec!["editor".into()],
            ..quick()
        };
        auto.start(settings).await.unwrap();
        let status = auto.stop().await.unwrap();

        assert!(!status.running);
        assert!(!status.enabled);
        let persisted = auto.service.store().auto_sync_settings().unwrap();
        assert!(!persisted.enabled);
        assert_eq!(persisted.destinations, vec!["editor".to_string()]);
        assert_eq!(persisted.debounce_ms, 50);
    }

    #[tokio::test]
    async fn stop_when_not_running_is_an_error() {
        let home = TempDir::new().unwrap();
        let auto = coordinator(&home);
        assert!(matches!(auto.stop().await, Err(AutoSyncError::NotRunning)));
    }

    #[tokio::test]
    async fn memory_storage_cannot_be_watched() {
        let store = Arc::new(ConfigStore::new(Arc::new(MemoryStorage::new()), EventBus::new()));
        let auto =
            AutoSyncCoordinator::new(SyncService::new(store, Arc::new(DestinationRegistry::new())));
        assert!(matches!(
            auto.start(quick()).await,
            Err(AutoSyncError::Unwatchable(_))
        ));
        assert_eq!(auto.phase(), AutoSyncPhase::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_leaves_persisted_flag_for_resume() {
        let home = TempDir::new().unwrap();
        let auto = coordinator(&home);
        auto.start(quick()).await.unwrap();
        auto.shutdown().await;
        assert!(!auto.is_running());
        assert!(auto.service.store().auto_sync_settings().unwrap().enabled);

        let restarted = coordinator(&home);
        assert!(restarted
            .resume_if_enabled(Duration::from_millis(10))
            .await
            .unwrap());
        assert_eq!(restarted.phase(), AutoSyncPhase::Running);
        assert!(!restarted
            .resume_if_enabled(Duration::from_millis(10))
            .await
            .unwrap());
        restarted.stop().await.unwrap();
    }

    #[test]
    fn targets_apply_whitelist_then_blacklist() {
        let registered: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let all = AutoSyncSettings::default();
        assert_eq!(resolve_targets(&all, &registered), registered);

        let listed = AutoSyncSettings {
            destinations: vec!["c".into(), "a".into(), "ghost".into()],
            exclude: vec!["a".into()],
            ..AutoSyncSettings::default()
        };
        assert_eq!(resolve_targets(&listed, &registered), vec!["c".to_string()]);

        let excluded = AutoSyncSettings {
            exclude: vec!["b".into()],
            ..AutoSyncSettings::default()
        };
        assert_eq!(
            resolve_targets(&excluded, &registered),
            vec!["a".to_string(), "c".to_string()]
        );
    }
}
