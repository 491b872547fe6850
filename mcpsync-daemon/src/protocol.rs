//! Newline-delimited JSON protocol.
//!
//! Each request is one JSON object tagged by `cmd`; each response is one
//! [`DaemonResponse`] line. `subscribe` keeps the connection open and
//! streams one response line per event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use mcpsync_core::{AutoSyncSettings, EventCategory, ServerConfig};
use mcpsync_sync::{FileDestinationSpec, SyncOptions};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DaemonRequest {
    AddServer {
        name: String,
        server: ServerConfig,
    },
    UpdateServer {
        name: String,
        server: ServerConfig,
    },
    RemoveServer {
        name: String,
    },
    GetServer {
        name: String,
    },
    ListServers,
    SyncTo {
        destination: String,
        #[serde(default)]
        options: SyncOptions,
    },
    SyncToMultiple {
        destinations: Vec<String>,
        #[serde(default)]
        options: SyncOptions,
    },
    SyncAll {
        #[serde(default)]
        options: SyncOptions,
    },
    PreviewSync {
        #[serde(default)]
        destinations: Vec<String>,
    },
    RegisterDestination {
        destination: FileDestinationSpec,
    },
    RemoveDestination {
        id: String,
    },
    GetDestination {
        id: String,
    },
    ListDestinations,
    /// Without settings, the persisted ones (or defaults) are used.
    StartAutoSync {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        settings: Option<AutoSyncSettings>,
    },
    StopAutoSync,
    GetAutoSyncStatus,
    Status,
    Shutdown,
    Subscribe {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        categories: Vec<EventCategory>,
    },
}

impl DaemonRequest {
    pub fn name(&self) -> &'static str {
        match self {
            DaemonRequest::AddServer { .. } => "add_server",
            DaemonRequest::UpdateServer { .. } => "update_server",
            DaemonRequest::RemoveServer { .. } => "remove_server",
            DaemonRequest::GetServer { .. } => "get_server",
            DaemonRequest::ListServers => "list_servers",
            DaemonRequest::SyncTo { .. } => "sync_to",
            DaemonRequest::SyncToMultiple { .. } => "sync_to_multiple",
            DaemonRequest::SyncAll { .. } => "sync_all",
            DaemonRequest::PreviewSync { .. } => "preview_sync",
            DaemonRequest::RegisterDestination { .. } => "register_destination",
            DaemonRequest::RemoveDestination { .. } => "remove_destination",
            DaemonRequest::GetDestination { .. } => "get_destination",
            DaemonRequest::ListDestinations => "list_destinations",
            DaemonRequest::StartAutoSync { .. } => "start_auto_sync",
            DaemonRequest::StopAutoSync => "stop_auto_sync",
            DaemonRequest::GetAutoSyncStatus => "get_auto_sync_status",
            DaemonRequest::Status => "status",
            DaemonRequest::Shutdown => "shutdown",
            DaemonRequest::Subscribe { .. } => "subscribe",
        }
    }
}

/// Machine-readable failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    Unavailable,
    DeadlineExceeded,
    ResourceExhausted,
    Internal,
}

impl ErrorCode {
    /// Transient classes a client may retry with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::Unavailable | ErrorCode::DeadlineExceeded | ErrorCode::ResourceExhausted
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            code: Some(code),
        }
    }
}
