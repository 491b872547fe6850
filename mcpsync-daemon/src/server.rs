//! RPC server: accept loop, line protocol per connection, request dispatch.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;

use mcpsync_core::{EventCategory, StoreError};
use mcpsync_sync::{SyncError, SyncService};

use crate::autosync::AutoSyncCoordinator;
use crate::config::ListenAddr;
use crate::error::{io_err, AutoSyncError, DaemonError};
use crate::protocol::{DaemonRequest, DaemonResponse, ErrorCode};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const REJECT_READ_TIMEOUT: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Activity tracking
// ---------------------------------------------------------------------------

/// Open connections and the time of the last request, for the idle monitor.
pub struct ActivityTracker {
    last_activity: Mutex<Instant>,
    connections: AtomicUsize,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            connections: AtomicUsize::new(0),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Count a connection until the returned guard drops.
    pub fn connect(self: &Arc<Self>) -> ConnectionGuard {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.touch();
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ConnectionGuard {
    tracker: Arc<ActivityTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.connections.fetch_sub(1, Ordering::SeqCst);
        self.tracker.touch();
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ServerLimits {
    pub max_connections: usize,
    pub read_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub sync_concurrency: usize,
}

/// Everything a connection handler needs; cheap to clone.
#[derive(Clone)]
pub struct ServerContext {
    pub service: SyncService,
    pub autosync: Arc<AutoSyncCoordinator>,
    pub activity: Arc<ActivityTracker>,
    pub shutdown: broadcast::Sender<()>,
    pub limits: ServerLimits,
    pub started_at: DateTime<Utc>,
    pub listen: String,
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

enum Accepted {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Listener {
    pub async fn bind(addr: &ListenAddr) -> Result<Self, DaemonError> {
        match addr {
            ListenAddr::Unix(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
                }
                prepare_socket_for_bind(path)?;
                let listener = bind_owner_only(path, addr)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            ListenAddr::Tcp(socket) => {
                let listener =
                    TcpListener::bind(socket)
                        .await
                        .map_err(|source| DaemonError::Bind {
                            addr: addr.to_string(),
                            source,
                        })?;
                Ok(Listener::Tcp(listener))
            }
        }
    }

    /// The bound address; for TCP this carries the real port when 0 was
    /// requested.
    pub fn local_addr(&self) -> Result<ListenAddr, DaemonError> {
        match self {
            Listener::Unix { path, .. } => Ok(ListenAddr::Unix(path.clone())),
            Listener::Tcp(listener) => listener
                .local_addr()
                .map(ListenAddr::Tcp)
                .map_err(|e| io_err("tcp listener", e)),
        }
    }

    async fn accept(&self) -> std::io::Result<Accepted> {
        match self {
            Listener::Unix { listener, .. } => {
                listener.accept().await.map(|(s, _)| Accepted::Unix(s))
            }
            Listener::Tcp(listener) => listener.accept().await.map(|(s, _)| Accepted::Tcp(s)),
        }
    }

    fn cleanup(&self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(err) = fs::remove_file(path) {
                if err.kind() != ErrorKind::NotFound {
                    tracing::warn!(socket = %path.display(), error = %err, "failed to remove daemon socket");
                }
            }
        }
    }
}

/// Accept connections until shutdown, then drain them within the shutdown
/// timeout.
pub async fn serve(listener: Listener, ctx: ServerContext) -> Result<(), DaemonError> {
    let mut shutdown_rx = ctx.shutdown.subscribe();
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => match accepted {
                Ok(stream) => admit(&mut connections, stream, &ctx),
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(done) = connections.join_next(), if !connections.is_empty() => {
                if let Err(err) = done {
                    if err.is_panic() {
                        tracing::error!(error = %err, "connection task panicked");
                    }
                }
            }
        }
    }

    let open = connections.len();
    if open > 0 {
        tracing::info!(open, "draining connections");
        let drained = tokio::time::timeout(ctx.limits.shutdown_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                remaining = connections.len(),
                "shutdown timeout reached; aborting connections",
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }
    }
    listener.cleanup();
    Ok(())
}

fn admit(connections: &mut JoinSet<()>, stream: Accepted, ctx: &ServerContext) {
    if ctx.activity.connections() >= ctx.limits.max_connections {
        tracing::warn!(
            max = ctx.limits.max_connections,
            "connection limit reached; rejecting client",
        );
        match stream {
            Accepted::Unix(s) => connections.spawn(reject(s)),
            Accepted::Tcp(s) => connections.spawn(reject(s)),
        };
        return;
    }

    let guard = ctx.activity.connect();
    let ctx = ctx.clone();
    match stream {
        Accepted::Unix(s) => connections.spawn(run_connection(s, ctx, guard)),
        Accepted::Tcp(s) => connections.spawn(run_connection(s, ctx, guard)),
    };
}

async fn run_connection<S>(stream: S, ctx: ServerContext, _guard: ConnectionGuard)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    if let Err(err) = handle_connection(stream, ctx).await {
        tracing::debug!(error = %err, "connection closed with error");
    }
}

async fn reject<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    // Consume the first request line before answering.
    let mut lines = BufReader::new(reader).lines();
    let _ = tokio::time::timeout(REJECT_READ_TIMEOUT, lines.next_line()).await;
    let response = DaemonResponse::error(ErrorCode::ResourceExhausted, "too many connections");
    let _ = write_response(&mut writer, &response).await;
    let _ = writer.shutdown().await;
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Serve one client until EOF, read timeout, shutdown or `shutdown`/`subscribe`.
pub(crate) async fn handle_connection<S>(stream: S, ctx: ServerContext) -> Result<(), DaemonError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        let line = tokio::select! {
            _ = shutdown_rx.recv() => break,
            read = tokio::time::timeout(ctx.limits.read_timeout, lines.next_line()) => match read {
                Err(_) => {
                    tracing::debug!("closing connection after read timeout");
                    break;
                }
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => break,
                Ok(Err(err)) => return Err(io_err("daemon socket read", err)),
            },
        };
        if line.trim().is_empty() {
            continue;
        }
        ctx.activity.touch();

        let request = match serde_json::from_str::<DaemonRequest>(&line) {
            Ok(request) => request,
            Err(err) => {
                let response =
                    DaemonResponse::error(ErrorCode::InvalidArgument, format!("invalid request: {err}"));
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        match request {
            DaemonRequest::Subscribe { categories } => {
                stream_events(&mut lines, &mut writer, &ctx, categories, &mut shutdown_rx).await?;
                break;
            }
            DaemonRequest::Shutdown => {
                tracing::info!("shutdown requested over RPC");
                write_response(&mut writer, &DaemonResponse::ok(json!({ "stopping": true })))
                    .await?;
                let _ = ctx.shutdown.send(());
                break;
            }
            request => {
                let response = execute(request, ctx.clone()).await;
                write_response(&mut writer, &response).await?;
                ctx.activity.touch();
            }
        }
    }
    Ok(())
}

async fn stream_events<R, W>(
    lines: &mut Lines<BufReader<R>>,
    writer: &mut W,
    ctx: &ServerContext,
    categories: Vec<EventCategory>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let events = ctx.service.events();
    let mut subscription = if categories.is_empty() {
        events.subscribe()
    } else {
        events.subscribe_to(categories)
    };
    write_response(writer, &DaemonResponse::ok(json!({ "subscribed": true }))).await?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            line = lines.next_line() => match line {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => break,
            },
            event = subscription.recv() => match event {
                Some(event) => {
                    let payload = serde_json::to_value(&event)?;
                    write_response(writer, &DaemonResponse::ok(payload)).await?;
                }
                None => break,
            },
        }
    }
    Ok(())
}

/// Run one request on its own task so a panicking handler only fails that
/// request.
async fn execute(request: DaemonRequest, ctx: ServerContext) -> DaemonResponse {
    let cmd = request.name();
    let started = Instant::now();
    let response = match tokio::spawn(dispatch(request, ctx)).await {
        Ok(Ok(data)) => DaemonResponse::ok(data),
        Ok(Err(err)) => DaemonResponse::error(err.code, err.message),
        Err(err) => {
            tracing::error!(cmd, error = %err, "request handler failed");
            DaemonResponse::error(ErrorCode::Internal, format!("{cmd} failed: internal error"))
        }
    };
    tracing::debug!(
        cmd,
        ok = response.ok,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "handled request",
    );
    response
}

async fn write_response<W>(writer: &mut W, response: &DaemonResponse) -> Result<(), DaemonError>
where
    W: AsyncWrite + Unpin,
{
    let mut payload = serde_json::to_vec(response)?;
    payload.push(b'\n');
    writer
        .write_all(&payload)
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// A failed request: code plus human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<StoreError> for RpcError {
    fn from(err: StoreError) -> Self {
        let code = match &err {
            StoreError::Validation { .. } => ErrorCode::InvalidArgument,
            StoreError::ServerExists { .. } => ErrorCode::AlreadyExists,
            StoreError::ServerNotFound { .. } => ErrorCode::NotFound,
            StoreError::Storage(_) | StoreError::Parse { .. } | StoreError::Serialize(_) => {
                ErrorCode::Internal
            }
        };
        Self::new(code, err.to_string())
    }
}

impl From<SyncError> for RpcError {
    fn from(err: SyncError) -> Self {
        let code = match &err {
            SyncError::NoDestinations => ErrorCode::InvalidArgument,
            SyncError::UnknownDestination(_) => ErrorCode::NotFound,
            SyncError::DestinationExists(_) => ErrorCode::AlreadyExists,
        };
        Self::new(code, err.to_string())
    }
}

impl From<AutoSyncError> for RpcError {
    fn from(err: AutoSyncError) -> Self {
        let code = match &err {
            AutoSyncError::Store(_) | AutoSyncError::Watch(_) => ErrorCode::Internal,
            AutoSyncError::AlreadyRunning
            | AutoSyncError::NotRunning
            | AutoSyncError::Transitioning(_)
            | AutoSyncError::Unwatchable(_) => ErrorCode::FailedPrecondition,
        };
        match err {
            AutoSyncError::Store(inner) => inner.into(),
            other => Self::new(code, other.to_string()),
        }
    }
}

impl From<JoinError> for RpcError {
    fn from(err: JoinError) -> Self {
        Self::new(ErrorCode::Internal, format!("worker task failed: {err}"))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Internal, format!("failed to encode response: {err}"))
    }
}

/// Run blocking store work off the async workers.
async fn blocking<T, E, F>(f: F) -> Result<T, RpcError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<RpcError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?.map_err(Into::into)
}

async fn dispatch(request: DaemonRequest, ctx: ServerContext) -> Result<Value, RpcError> {
    let service = &ctx.service;
    match request {
        DaemonRequest::AddServer { name, server } => {
            let store = Arc::clone(service.store());
            let added = blocking(move || store.add_server(&name, server)).await?;
            Ok(json!({ "name": added.as_str() }))
        }
        DaemonRequest::UpdateServer { name, server } => {
            let store = Arc::clone(service.store());
            let key = name.clone();
            blocking(move || store.update_server(&key, server)).await?;
            Ok(json!({ "name": name }))
        }
        DaemonRequest::RemoveServer { name } => {
            let store = Arc::clone(service.store());
            let key = name.clone();
            let removed = blocking(move || store.remove_server(&key)).await?;
            Ok(json!({ "name": name, "server": removed }))
        }
        DaemonRequest::GetServer { name } => {
            let server = service.store().get_server(&name).ok_or_else(|| {
                RpcError::new(ErrorCode::NotFound, format!("server '{name}' not found"))
            })?;
            Ok(json!({ "name": name, "server": server }))
        }
        DaemonRequest::ListServers => {
            let mut servers = Map::new();
            for (name, server) in service.store().list_servers() {
                servers.insert(name.0, serde_json::to_value(server)?);
            }
            Ok(json!({ "servers": servers }))
        }
        DaemonRequest::SyncTo {
            destination,
            options,
        } => {
            let result = service.sync_to(&destination, options).await?;
            Ok(serde_json::to_value(result)?)
        }
        DaemonRequest::SyncToMultiple {
            destinations,
            options,
        } => {
            let multi = service.sync_to_multiple(&destinations, options).await?;
            Ok(serde_json::to_value(multi)?)
        }
        DaemonRequest::SyncAll { options } => {
            let multi = service
                .sync_all(options, ctx.limits.sync_concurrency)
                .await?;
            Ok(serde_json::to_value(multi)?)
        }
        DaemonRequest::PreviewSync { destinations } => {
            let previews = service.preview(&destinations).await?;
            Ok(json!({ "previews": previews }))
        }
        DaemonRequest::RegisterDestination { destination } => {
            let id = destination.id.clone();
            service.register_file_destination(destination)?;
            tracing::info!(destination = %id, "registered destination");
            Ok(json!({ "id": id }))
        }
        DaemonRequest::RemoveDestination { id } => {
            service.destinations().remove(&id)?;
            tracing::info!(destination = %id, "removed destination");
            Ok(json!({ "id": id }))
        }
        DaemonRequest::GetDestination { id } => {
            Ok(serde_json::to_value(service.destinations().info(&id)?)?)
        }
        DaemonRequest::ListDestinations => {
            Ok(json!({ "destinations": service.destinations().list() }))
        }
        DaemonRequest::StartAutoSync { settings } => {
            let settings = settings.unwrap_or_else(|| ctx.autosync.persisted_or_default());
            let status = ctx.autosync.start(settings).await?;
            Ok(serde_json::to_value(status)?)
        }
        DaemonRequest::StopAutoSync => {
            let status = ctx.autosync.stop().await?;
            Ok(serde_json::to_value(status)?)
        }
        DaemonRequest::GetAutoSyncStatus => Ok(serde_json::to_value(ctx.autosync.status())?),
        DaemonRequest::Status => status_payload(&ctx),
        DaemonRequest::Shutdown => {
            let _ = ctx.shutdown.send(());
            Ok(json!({ "stopping": true }))
        }
        DaemonRequest::Subscribe { .. } => Err(RpcError::new(
            ErrorCode::FailedPrecondition,
            "subscribe must be the first request on a connection",
        )),
    }
}

fn status_payload(ctx: &ServerContext) -> Result<Value, RpcError> {
    let uptime = (Utc::now() - ctx.started_at).num_seconds().max(0);
    Ok(json!({
        "running": true,
        "pid": std::process::id(),
        "started_at": ctx.started_at,
        "uptime_secs": uptime,
        "listen": ctx.listen,
        "connections": ctx.activity.connections(),
        "idle_ms": ctx.activity.idle_for().as_millis() as u64,
        "servers": ctx.service.store().server_count(),
        "destinations": ctx.service.destinations().ids(),
        "auto_sync": serde_json::to_value(ctx.autosync.status())?,
        "events_dropped": ctx.service.events().dropped(),
    }))
}

// ---------------------------------------------------------------------------
// Unix socket helpers
// ---------------------------------------------------------------------------

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => return Err(DaemonError::SocketInUse(socket.to_path_buf())),
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

/// Bind in an owner-only staging directory, restrict the socket, then move
/// it into place. The socket is never reachable at the default mode.
fn bind_owner_only(path: &Path, addr: &ListenAddr) -> Result<UnixListener, DaemonError> {
    use std::os::unix::fs::DirBuilderExt;

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let staging = parent.join(format!(".bind-{}", std::process::id()));
    let _ = fs::remove_dir_all(&staging);
    fs::DirBuilder::new()
        .mode(0o700)
        .create(&staging)
        .map_err(|e| io_err(&staging, e))?;

    let staged = staging.join("s");
    let bound = (|| -> Result<UnixListener, DaemonError> {
        let listener = UnixListener::bind(&staged).map_err(|source| DaemonError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        set_socket_permissions(&staged)?;
        fs::rename(&staged, path).map_err(|e| io_err(path, e))?;
        Ok(listener)
    })();
    let _ = fs::remove_dir_all(&staging);
    bound
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpsync_core::{ConfigStore, EventBus, MemoryStorage};
    use mcpsync_sync::DestinationRegistry;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};

    fn context() -> ServerContext {
        let store = Arc::new(ConfigStore::new(Arc::new(MemoryStorage::new()), EventBus::new()));
        let service = SyncService::new(store, Arc::new(DestinationRegistry::new()));
        let (shutdown, _) = broadcast::channel(4);
        ServerContext {
            autosync: Arc::new(AutoSyncCoordinator::new(service.clone())),
            service,
            activity: Arc::new(ActivityTracker::new()),
            shutdown,
            limits: ServerLimits {
                max_connections: 4,
                read_timeout: Duration::from_secs(5),
                shutdown_timeout: Duration::from_secs(1),
                sync_concurrency: 2,
            },
            started_at: Utc::now(),
            listen: "unix:/tmp/test.sock".into(),
        }
    }

    struct Client {
        lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
        writer: tokio::io::WriteHalf<DuplexStream>,
    }

    impl Client {
        fn connect(ctx: &ServerContext) -> Self {
            let (client, server) = duplex(64 * 1024);
            tokio::spawn(handle_connection(server, ctx.clone()));
            let (reader, writer) = tokio::io::split(client);
            Self {
                lines: BufReader::new(reader).lines(),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) -> Value {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.next().await
        }

        async fn call(&mut self, request: Value) -> Value {
            self.send_raw(&request.to_string()).await
        }

        async fn next(&mut self) -> Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("response in time")
                .unwrap()
                .expect("open connection");
            serde_json::from_str(&line).unwrap()
        }
    }

    #[tokio::test]
    async fn server_crud_round_trip() {
        let ctx = context();
        let mut client = Client::connect(&ctx);

        let added = client
            .call(json!({
                "cmd": "add_server",
                "name": "fs",
                "server": {"transport": "stdio", "command": "mcp-fs"}
            }))
            .await;
        assert_eq!(added["ok"], true);
        assert_eq!(added["data"]["name"], "fs");

        let dup = client
            .call(json!({
                "cmd": "add_server",
                "name": "fs",
                "server": {"transport": "stdio", "command": "other"}
            }))
            .await;
        assert_eq!(dup["ok"], false);
        assert_eq!(dup["code"], "already_exists");

        let fetched = client.call(json!({"cmd": "get_server", "name": "fs"})).await;
        assert_eq!(fetched["data"]["server"]["command"], "mcp-fs");

        let listed = client.call(json!({"cmd": "list_servers"})).await;
        assert!(listed["data"]["servers"]["fs"].is_object());

        client.call(json!({"cmd": "remove_server", "name": "fs"})).await;
        let missing = client.call(json!({"cmd": "get_server", "name": "fs"})).await;
        assert_eq!(missing["code"], "not_found");
    }

    #[tokio::test]
    async fn invalid_json_keeps_the_connection_usable() {
        let ctx = context();
        let mut client = Client::connect(&ctx);

        let bad = client.send_raw("{not json").await;
        assert_eq!(bad["ok"], false);
        assert_eq!(bad["code"], "invalid_argument");

        let unknown = client.call(json!({"cmd": "frobnicate"})).await;
        assert_eq!(unknown["code"], "invalid_argument");

        let status = client.call(json!({"cmd": "status"})).await;
        assert_eq!(status["ok"], true);
        assert_eq!(status["data"]["servers"], 0);
        assert_eq!(status["data"]["auto_sync"]["phase"], "stopped");
    }

    #[tokio::test]
    async fn destinations_register_sync_and_remove() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("editor.json");
        let ctx = context();
        ctx.service
            .store()
            .add_server("fs", mcpsync_core::ServerConfig::new(mcpsync_core::Transport::stdio("mcp-fs")))
            .unwrap();
        let mut client = Client::connect(&ctx);

        let registered = client
            .call(json!({
                "cmd": "register_destination",
                "destination": {"id": "editor", "path": target}
            }))
            .await;
        assert_eq!(registered["data"]["id"], "editor");

        let again = client
            .call(json!({
                "cmd": "register_destination",
                "destination": {"id": "editor", "path": target}
            }))
            .await;
        assert_eq!(again["code"], "already_exists");

        let synced = client
            .call(json!({"cmd": "sync_to", "destination": "editor"}))
            .await;
        assert_eq!(synced["ok"], true, "{synced}");
        assert_eq!(synced["data"]["success"], true);
        assert!(target.exists());

        let listed = client.call(json!({"cmd": "list_destinations"})).await;
        assert_eq!(listed["data"]["destinations"][0]["id"], "editor");

        client.call(json!({"cmd": "remove_destination", "id": "editor"})).await;
        let gone = client.call(json!({"cmd": "get_destination", "id": "editor"})).await;
        assert_eq!(gone["code"], "not_found");

        let nothing = client.call(json!({"cmd": "sync_all"})).await;
        assert_eq!(nothing["code"], "invalid_argument");
    }

    #[tokio::test]
    async fn subscribers_receive_filtered_events() {
        let ctx = context();
        let mut subscriber = Client::connect(&ctx);
        let ack = subscriber
            .call(json!({"cmd": "subscribe", "categories": ["server"]}))
            .await;
        assert_eq!(ack["data"]["subscribed"], true);

        let mut client = Client::connect(&ctx);
        client
            .call(json!({
                "cmd": "add_server",
                "name": "web",
                "server": {"transport": "http", "url": "https://mcp.example.com"}
            }))
            .await;

        let event = subscriber.next().await;
        assert_eq!(event["data"]["type"], "server_added");
        assert_eq!(event["data"]["name"], "web");
    }

    #[tokio::test]
    async fn shutdown_request_is_acknowledged_then_broadcast() {
        let ctx = context();
        let mut shutdown_rx = ctx.shutdown.subscribe();
        let mut client = Client::connect(&ctx);

        let response = client.call(json!({"cmd": "shutdown"})).await;
        assert_eq!(response["data"]["stopping"], true);
        tokio::time::timeout(Duration::from_secs(1), shutdown_rx.recv())
            .await
            .expect("shutdown broadcast")
            .unwrap();
    }

    #[tokio::test]
    async fn auto_sync_on_memory_storage_is_a_failed_precondition() {
        let ctx = context();
        let mut client = Client::connect(&ctx);
        let response = client.call(json!({"cmd": "start_auto_sync"})).await;
        assert_eq!(response["code"], "failed_precondition");
        let stop = client.call(json!({"cmd": "stop_auto_sync"})).await;
        assert_eq!(stop["code"], "failed_precondition");
    }

    #[test]
    fn store_errors_map_to_codes() {
        let err: RpcError = StoreError::ServerNotFound { name: "x".into() }.into();
        assert_eq!(err.code, ErrorCode::NotFound);
        let err: RpcError = StoreError::Validation {
            name: "x".into(),
            reason: "empty command".into(),
        }
        .into();
        assert_eq!(err.code, ErrorCode::InvalidArgument);
        let err: RpcError = SyncError::UnknownDestination("d".into()).into();
        assert_eq!(err.code, ErrorCode::NotFound);
        let err: RpcError = AutoSyncError::AlreadyRunning.into();
        assert_eq!(err.code, ErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn guards_track_open_connections() {
        let tracker = Arc::new(ActivityTracker::new());
        let first = tracker.connect();
        let second = tracker.connect();
        assert_eq!(tracker.connections(), 2);
        drop(first);
        assert_eq!(tracker.connections(), 1);
        drop(second);
        assert_eq!(tracker.connections(), 0);
        assert!(tracker.idle_for() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.sock");
        fs::write(&path, b"").unwrap();
        let listener = Listener::bind(&ListenAddr::Unix(path.clone())).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), ListenAddr::Unix(path.clone()));

        assert!(matches!(
            Listener::bind(&ListenAddr::Unix(path.clone())).await,
            Err(DaemonError::SocketInUse(_))
        ));
        listener.cleanup();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unix_socket_is_owner_only_and_staging_is_removed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("daemon.sock");
        let listener = Listener::bind(&ListenAddr::Unix(path.clone())).await.unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("daemon.sock")]);

        StdUnixStream::connect(&path).unwrap();
        listener.cleanup();
    }
}
