//! Client side of the daemon protocol: one connection per call.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, UnixStream};

use mcpsync_core::{AutoSyncSettings, Event, EventCategory, ServerConfig};
use mcpsync_sync::{FileDestinationSpec, MultiSyncResult, SyncOptions, SyncResult};

use crate::autosync::AutoSyncStatus;
use crate::config::{DaemonSettings, ListenAddr};
use crate::error::{ClientError, ConfigError};
use crate::protocol::{DaemonRequest, DaemonResponse, ErrorCode};

/// Per-call timeout unless overridden.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

type BoxedStream = Box<dyn Duplex>;

#[derive(Debug, Clone)]
pub struct DaemonClient {
    addr: ListenAddr,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(addr: ListenAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Client for the daemon configured under `home`.
    pub fn for_home(home: &Path) -> Result<Self, ConfigError> {
        Ok(Self::new(DaemonSettings::load(home)?.listen))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn addr(&self) -> &ListenAddr {
        &self.addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn connect(&self) -> Result<BoxedStream, ClientError> {
        let unavailable = |source| ClientError::Unavailable {
            addr: self.addr.to_string(),
            source,
        };
        match &self.addr {
            ListenAddr::Unix(path) => Ok(Box::new(
                UnixStream::connect(path).await.map_err(unavailable)?,
            )),
            ListenAddr::Tcp(addr) => Ok(Box::new(
                TcpStream::connect(addr).await.map_err(unavailable)?,
            )),
        }
    }

    /// Send one request and wait for its response, bounded by the call
    /// timeout.
    pub async fn call(&self, request: &DaemonRequest) -> Result<Value, ClientError> {
        tokio::time::timeout(self.timeout, self.call_once(request))
            .await
            .map_err(|_| ClientError::DeadlineExceeded(self.timeout))?
    }

    async fn call_once(&self, request: &DaemonRequest) -> Result<Value, ClientError> {
        let stream = self.connect().await?;
        let (reader, mut writer) = tokio::io::split(stream);
        send_line(&mut writer, request).await?;

        let mut lines = BufReader::new(reader).lines();
        let response = read_response(&mut lines).await?.ok_or_else(|| {
            ClientError::Protocol(format!(
                "daemon closed the connection without answering {}",
                request.name()
            ))
        })?;
        into_result(response)
    }

    async fn call_as<T: DeserializeOwned>(&self, request: DaemonRequest) -> Result<T, ClientError> {
        let data = self.call(&request).await?;
        Ok(serde_json::from_value(data)?)
    }

    /// Open an event stream. Only the subscription handshake is bounded by
    /// the call timeout.
    pub async fn subscribe(&self, categories: Vec<EventCategory>) -> Result<EventStream, ClientError> {
        let request = DaemonRequest::Subscribe { categories };
        tokio::time::timeout(self.timeout, async {
            let stream = self.connect().await?;
            let (reader, mut writer) = tokio::io::split(stream);
            send_line(&mut writer, &request).await?;
            let mut lines = BufReader::new(reader).lines();
            match read_response(&mut lines).await? {
                Some(ack) => {
                    into_result(ack)?;
                    Ok(EventStream {
                        lines,
                        _writer: writer,
                    })
                }
                None => Err(ClientError::Protocol(
                    "daemon closed the connection during subscribe".into(),
                )),
            }
        })
        .await
        .map_err(|_| ClientError::DeadlineExceeded(self.timeout))?
    }

    // --- typed helpers ---------------------------------------------------

    pub async fn status(&self) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::Status).await
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.call(&DaemonRequest::Shutdown).await.map(|_| ())
    }

    pub async fn add_server(&self, name: &str, server: ServerConfig) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::AddServer {
            name: name.to_string(),
            server,
        })
        .await
    }

    pub async fn remove_server(&self, name: &str) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::RemoveServer {
            name: name.to_string(),
        })
        .await
    }

    pub async fn list_servers(&self) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::ListServers).await
    }

    pub async fn register_destination(&self, spec: FileDestinationSpec) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::RegisterDestination { destination: spec })
            .await
    }

    pub async fn list_destinations(&self) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::ListDestinations).await
    }

    pub async fn sync_to(&self, destination: &str, options: SyncOptions) -> Result<SyncResult, ClientError> {
        self.call_as(DaemonRequest::SyncTo {
            destination: destination.to_string(),
            options,
        })
        .await
    }

    pub async fn sync_all(&self, options: SyncOptions) -> Result<MultiSyncResult, ClientError> {
        self.call_as(DaemonRequest::SyncAll { options }).await
    }

    pub async fn preview(&self, destinations: Vec<String>) -> Result<Value, ClientError> {
        self.call(&DaemonRequest::PreviewSync { destinations }).await
    }

    pub async fn start_auto_sync(
        &self,
        settings: Option<AutoSyncSettings>,
    ) -> Result<AutoSyncStatus, ClientError> {
        self.call_as(DaemonRequest::StartAutoSync { settings }).await
    }

    pub async fn stop_auto_sync(&self) -> Result<AutoSyncStatus, ClientError> {
        self.call_as(DaemonRequest::StopAutoSync).await
    }

    pub async fn auto_sync_status(&self) -> Result<AutoSyncStatus, ClientError> {
        self.call_as(DaemonRequest::GetAutoSyncStatus).await
    }
}

/// Events pushed by the daemon after a successful `subscribe`.
pub struct EventStream {
    lines: Lines<BufReader<ReadHalf<BoxedStream>>>,
    _writer: WriteHalf<BoxedStream>,
}

impl EventStream {
    /// Next event; `None` once the daemon closes the stream.
    pub async fn next(&mut self) -> Result<Option<Event>, ClientError> {
        match read_response(&mut self.lines).await? {
            Some(response) => Ok(Some(serde_json::from_value(into_result(response)?)?)),
            None => Ok(None),
        }
    }
}

async fn send_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request: &DaemonRequest,
) -> Result<(), ClientError> {
    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_response<R: AsyncRead + Unpin>(
    lines: &mut Lines<BufReader<R>>,
) -> Result<Option<DaemonResponse>, ClientError> {
    loop {
        match lines.next_line().await? {
            Some(line) if line.trim().is_empty() => continue,
            Some(line) => return Ok(Some(serde_json::from_str(&line)?)),
            None => return Ok(None),
        }
    }
}

fn into_result(response: DaemonResponse) -> Result<Value, ClientError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(ClientError::Rpc {
        code: response.code.unwrap_or(ErrorCode::Internal),
        message: response
            .error
            .unwrap_or_else(|| "daemon reported an unspecified error".to_string()),
    })
}
