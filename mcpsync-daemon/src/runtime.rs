//! Daemon process model: startup, background tasks, idle shutdown and the
//! ordered shutdown sequence.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing_subscriber::fmt::MakeWriter;

use mcpsync_core::{ConfigStore, EventBus, FileStorage, MemoryStorage, Storage};
use mcpsync_sync::{DestinationRegistry, SyncService};

use crate::autosync::AutoSyncCoordinator;
use crate::config::{DaemonSettings, ListenAddr, StorageBackend, MIN_IDLE_CHECK};
use crate::error::{io_err, DaemonError};
use crate::lock::{FileLock, SingleInstanceLock};
use crate::log_rotation::{rotation_task, ROTATION_CHECK_INTERVAL};
use crate::server::{self, ActivityTracker, Listener, ServerContext, ServerLimits};

/// Extra time the server task gets beyond its own drain timeout.
const SERVER_GRACE: Duration = Duration::from_secs(1);

pub struct Daemon {
    settings: DaemonSettings,
    service: SyncService,
    autosync: Arc<AutoSyncCoordinator>,
    activity: Arc<ActivityTracker>,
    lock: Box<dyn SingleInstanceLock>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    server: JoinHandle<Result<(), DaemonError>>,
    background: Vec<(&'static str, JoinHandle<()>)>,
    local_addr: ListenAddr,
    started_at: DateTime<Utc>,
}

impl Daemon {
    /// Load the store, take the lock, bind the listener and start every
    /// background task. Fails without side effects left behind when the lock
    /// is held or the address cannot be bound.
    pub async fn start(settings: DaemonSettings) -> Result<Self, DaemonError> {
        let storage: Arc<dyn Storage> = match &settings.storage {
            StorageBackend::File(root) => Arc::new(FileStorage::new(root)),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        };
        let store = Arc::new(ConfigStore::new(storage, EventBus::new()));
        let loaded = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || store.load())
                .await
                .map_err(|err| join_error("config_load", err))??
        };
        tracing::info!(
            servers = loaded,
            storage = %store.storage_description(),
            "config loaded"
        );

        let service = SyncService::new(store, Arc::new(DestinationRegistry::new()));
        for spec in &settings.destinations {
            service.register_file_destination(spec.clone())?;
        }

        let mut lock: Box<dyn SingleInstanceLock> = Box::new(FileLock::new(&settings.lock_file));
        lock.acquire()?;

        // The lock is released by its Drop if binding fails.
        let listener = Listener::bind(&settings.listen).await?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);
        let autosync = Arc::new(
            AutoSyncCoordinator::new(service.clone())
                .with_ignore(settings.watch_ignore.clone())
                .with_concurrency(settings.sync_concurrency),
        );
        let activity = Arc::new(ActivityTracker::new());
        let started_at = Utc::now();

        let ctx = ServerContext {
            service: service.clone(),
            autosync: Arc::clone(&autosync),
            activity: Arc::clone(&activity),
            shutdown: shutdown_tx.clone(),
            limits: ServerLimits {
                max_connections: settings.max_connections,
                read_timeout: settings.read_timeout,
                shutdown_timeout: settings.shutdown_timeout,
                sync_concurrency: settings.sync_concurrency,
            },
            started_at,
            listen: local_addr.to_string(),
        };
        let server = {
            let shutdown = shutdown_tx.clone();
            tokio::spawn(async move {
                let result = server::serve(listener, ctx).await;
                let _ = shutdown.send(());
                result
            })
        };

        let mut background = Vec::new();
        if settings.idle_monitor_enabled() {
            background.push((
                "idle_monitor",
                tokio::spawn(idle_monitor(
                    Arc::clone(&activity),
                    Arc::clone(&autosync),
                    settings.idle_timeout,
                    settings.idle_check,
                    shutdown_tx.clone(),
                )),
            ));
        }
        if let Some(log_file) = &settings.log_file {
            background.push((
                "log_rotation",
                tokio::spawn(rotation_task(
                    log_file.clone(),
                    settings.log_rotation,
                    ROTATION_CHECK_INTERVAL,
                    shutdown_tx.subscribe(),
                )),
            ));
        }
        background.push((
            "auto_sync_resume",
            tokio::spawn(resume_auto_sync(
                Arc::clone(&autosync),
                settings.resume_delay,
                shutdown_tx.subscribe(),
            )),
        ));

        tracing::info!(
            pid = std::process::id(),
            listen = %local_addr,
            lock = %lock.describe(),
            idle_timeout_ms = settings.idle_timeout.as_millis() as u64,
            "daemon started"
        );

        Ok(Self {
            settings,
            service,
            autosync,
            activity,
            lock,
            shutdown_tx,
            shutdown_rx,
            server,
            background,
            local_addr,
            started_at,
        })
    }

    pub fn local_addr(&self) -> &ListenAddr {
        &self.local_addr
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn service(&self) -> &SyncService {
        &self.service
    }

    pub fn autosync(&self) -> &Arc<AutoSyncCoordinator> {
        &self.autosync
    }

    pub fn activity(&self) -> &Arc<ActivityTracker> {
        &self.activity
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Resolves once anything (RPC, idle monitor, server exit, caller)
    /// requested shutdown.
    pub async fn wait(&mut self) {
        let _ = self.shutdown_rx.recv().await;
    }

    /// Run until a shutdown request or SIGINT/SIGTERM, then shut down.
    pub async fn run_until_stopped(mut self) -> Result<(), DaemonError> {
        tokio::select! {
            _ = self.wait() => {}
            _ = termination_signal() => tracing::info!("received termination signal"),
        }
        self.shutdown().await
    }

    /// Drain the server, stop background tasks, stop auto-sync, release the
    /// lock. Every wait is bounded by the shutdown timeout.
    pub async fn shutdown(mut self) -> Result<(), DaemonError> {
        tracing::info!("daemon shutting down");
        let _ = self.shutdown_tx.send(());
        let timeout = self.settings.shutdown_timeout;

        let server_result =
            match tokio::time::timeout(timeout + SERVER_GRACE, &mut self.server).await {
                Ok(joined) => handle_join("server", joined),
                Err(_) => {
                    tracing::warn!("server did not stop in time; aborting");
                    self.server.abort();
                    Ok(())
                }
            };

        for (task, mut handle) in self.background.drain(..) {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::error!(task, error = %err, "background task failed"),
                Err(_) => {
                    tracing::warn!(task, "background task did not stop in time; aborting");
                    handle.abort();
                }
            }
        }

        self.autosync.shutdown().await;
        self.lock.release()?;
        tracing::info!("daemon stopped");
        server_result
    }
}

/// Start the daemon and block the current thread until it exits.
pub fn start_blocking(settings: DaemonSettings) -> Result<(), DaemonError> {
    init_tracing(settings.log_file.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(settings))
}

/// Start `settings` and run until stopped.
pub async fn run(settings: DaemonSettings) -> Result<(), DaemonError> {
    Daemon::start(settings).await?.run_until_stopped().await
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Whether an idle daemon should stop itself.
pub(crate) fn idle_expired(
    connections: usize,
    autosync_running: bool,
    idle: Duration,
    timeout: Duration,
) -> bool {
    !timeout.is_zero() && connections == 0 && !autosync_running && idle >= timeout
}

async fn idle_monitor(
    activity: Arc<ActivityTracker>,
    autosync: Arc<AutoSyncCoordinator>,
    timeout: Duration,
    every: Duration,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown_rx = shutdown_tx.subscribe();
    let mut interval = tokio::time::interval(every.max(MIN_IDLE_CHECK));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let idle = activity.idle_for();
                if idle_expired(activity.connections(), autosync.is_running(), idle, timeout) {
                    tracing::info!(idle_ms = idle.as_millis() as u64, "idle timeout reached; shutting down");
                    let _ = shutdown_tx.send(());
                    break;
                }
            }
        }
    }
}

async fn resume_auto_sync(
    autosync: Arc<AutoSyncCoordinator>,
    delay: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        resumed = autosync.resume_if_enabled(delay) => {
            if let Err(err) = resumed {
                tracing::warn!(error = %err, "failed to resume auto-sync");
            }
        }
    }
}

async fn termination_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn join_error(task: &'static str, err: JoinError) -> DaemonError {
    DaemonError::Join {
        task,
        message: err.to_string(),
    }
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(join_error(task, err)),
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Opens the log file in append mode per write so rotation (rename + fresh
/// file) takes effect without re-initialising the subscriber.
struct AppendFile {
    path: PathBuf,
}

impl<'a> MakeWriter<'a> for AppendFile {
    type Writer = Box<dyn io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => Box::new(file),
            Err(_) => Box::new(io::stderr()),
        }
    }
}

/// Install the global subscriber: `RUST_LOG` filter (default `info`), to
/// `log_file` without ANSI colours when given, else stderr.
pub fn init_tracing(log_file: Option<&Path>) -> Result<(), DaemonError> {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(AppendFile {
                    path: path.to_path_buf(),
                })
                .try_init()
        }
        None => fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(io::stderr)
            .try_init(),
    };
    installed.map_err(|err| DaemonError::Logging(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_millis(200);

    #[test]
    fn idle_expiry_requires_every_condition() {
        let idle = Duration::from_millis(250);
        assert!(idle_expired(0, false, idle, TIMEOUT));
        assert!(!idle_expired(1, false, idle, TIMEOUT), "open connection");
        assert!(!idle_expired(0, true, idle, TIMEOUT), "auto-sync running");
        assert!(!idle_expired(0, false, Duration::from_millis(150), TIMEOUT));
        assert!(!idle_expired(0, false, Duration::from_secs(3600), Duration::ZERO));
    }

    fn settings(home: &TempDir) -> DaemonSettings {
        let config = DaemonConfig {
            idle_timeout_ms: Some(0),
            resume_delay_ms: Some(10),
            shutdown_timeout_ms: Some(500),
            ..DaemonConfig::default()
        };
        config.apply_defaults(home.path())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_shutdown_releases_lock_and_socket() {
        let home = TempDir::new().unwrap();
        let settings = settings(&home);
        let lock_file = settings.lock_file.clone();

        let daemon = Daemon::start(settings.clone()).await.unwrap();
        let ListenAddr::Unix(socket) = daemon.local_addr().clone() else {
            panic!("default listener is a unix socket");
        };
        assert!(socket.exists());
        assert!(lock_file.exists());

        daemon.shutdown().await.unwrap();
        assert!(!socket.exists());
        assert!(!lock_file.exists());

        // A fresh start on the same home succeeds once released.
        Daemon::start(settings).await.unwrap().shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn configured_destinations_are_registered() {
        let home = TempDir::new().unwrap();
        let mut settings = settings(&home);
        settings.destinations.push(mcpsync_sync::FileDestinationSpec {
            id: "editor".into(),
            path: home.path().join("editor.json"),
            servers_key: mcpsync_sync::file_destination::DEFAULT_SERVERS_KEY.into(),
            description: None,
        });

        let daemon = Daemon::start(settings).await.unwrap();
        assert_eq!(daemon.service().destinations().ids(), vec!["editor".to_string()]);
        daemon.shutdown().await.unwrap();
    }
}
