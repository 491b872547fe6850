//! Generic JSON-file destination.
//!
//! Servers live under one top-level key (`mcpServers` by default) of a JSON
//! document; every other top-level key is preserved on write.
//!
//! ## Write protocol
//!
//! 1. Merge the new entries into the existing document.
//! 2. Render pretty JSON with a trailing newline.
//! 3. SHA-256 the rendered bytes and the bytes on disk → skip if identical.
//! 4. Write to `<path>.mcpsync.tmp`.
//! 5. Rename to the final path (atomic on POSIX).

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use mcpsync_core::{ServerConfig, ServerName, Transport};

use crate::destination::{Destination, ServerEntries};
use crate::error::{io_err, DestinationError};

pub const DEFAULT_SERVERS_KEY: &str = "mcpServers";

fn default_servers_key() -> String {
    DEFAULT_SERVERS_KEY.to_string()
}

/// Serializable description of a [`JsonFileDestination`], as found in the
/// daemon config or a `RegisterDestination` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDestinationSpec {
    pub id: String,
    pub path: PathBuf,
    #[serde(default = "default_servers_key")]
    pub servers_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Outcome of the hash-gated write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct JsonFileDestination {
    spec: FileDestinationSpec,
}

impl JsonFileDestination {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self::from_spec(FileDestinationSpec {
            id: id.into(),
            path: path.into(),
            servers_key: default_servers_key(),
            description: None,
        })
    }

    pub fn from_spec(spec: FileDestinationSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &FileDestinationSpec {
        &self.spec
    }

    pub fn path(&self) -> &Path {
        &self.spec.path
    }

    fn read_document(&self) -> Result<Option<Map<String, Value>>, DestinationError> {
        let path = &self.spec.path;
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_err(path, err)),
        };
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let value: Value = serde_json::from_str(&raw).map_err(|source| DestinationError::Json {
            path: path.clone(),
            source,
        })?;
        match value {
            Value::Object(map) => Ok(Some(map)),
            other => Err(DestinationError::Shape {
                path: path.clone(),
                reason: format!("expected a JSON object at the top level, found {}", kind_of(&other)),
            }),
        }
    }

    /// Write `content` through a temp file unless the file already holds it.
    pub(crate) fn atomic_write(&self, content: &str) -> Result<WriteOutcome, DestinationError> {
        let tmp = PathBuf::from(format!("{}.mcpsync.tmp", self.spec.path.display()));
        atomic_write_with_tmp(&self.spec.path, content, &tmp)
    }
}

impl Destination for JsonFileDestination {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn description(&self) -> String {
        self.spec
            .description
            .clone()
            .unwrap_or_else(|| format!("JSON file {}", self.spec.path.display()))
    }

    fn transform(
        &self,
        servers: &BTreeMap<ServerName, ServerConfig>,
    ) -> Result<ServerEntries, DestinationError> {
        Ok(servers
            .iter()
            .map(|(name, server)| (name.0.clone(), entry_for(&server.transport)))
            .collect())
    }

    fn read(&self) -> Result<Option<ServerEntries>, DestinationError> {
        let Some(document) = self.read_document()? else {
            return Ok(None);
        };
        match document.get(&self.spec.servers_key) {
            None | Some(Value::Null) => Ok(Some(ServerEntries::new())),
            Some(Value::Object(servers)) => Ok(Some(
                servers
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect(),
            )),
            Some(other) => Err(DestinationError::Shape {
                path: self.spec.path.clone(),
                reason: format!(
                    "'{}' must be an object, found {}",
                    self.spec.servers_key,
                    kind_of(other)
                ),
            }),
        }
    }

    fn write(&self, entries: &ServerEntries) -> Result<(), DestinationError> {
        let mut document = self.read_document()?.unwrap_or_default();
        let servers: Map<String, Value> = entries
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        document.insert(self.spec.servers_key.clone(), Value::Object(servers));

        let mut rendered = serde_json::to_string_pretty(&Value::Object(document)).map_err(|e| {
            DestinationError::Transform(format!("cannot render {}: {e}", self.spec.path.display()))
        })?;
        rendered.push('\n');

        match self.atomic_write(&rendered)? {
            WriteOutcome::Written => tracing::info!("wrote: {}", self.spec.path.display()),
            WriteOutcome::Unchanged => tracing::debug!("unchanged: {}", self.spec.path.display()),
        }
        Ok(())
    }

    fn exists(&self) -> bool {
        self.spec.path.is_file()
    }

    fn supports_backup(&self) -> bool {
        true
    }

    fn backup(&self) -> Result<PathBuf, DestinationError> {
        let path = &self.spec.path;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.spec.id.clone());
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let backup = path.with_file_name(format!("{name}.backup.{stamp}"));
        std::fs::copy(path, &backup).map_err(|e| io_err(&backup, e))?;
        tracing::info!("backed up {} to {}", path.display(), backup.display());
        Ok(backup)
    }
}

/// Generic native shape: `{command, args?, env?}` or `{type, url, headers?}`.
fn entry_for(transport: &Transport) -> Value {
    match transport {
        Transport::Stdio { command, args, env } => {
            let mut entry = json!({ "command": command });
            if !args.is_empty() {
                entry["args"] = json!(args);
            }
            if !env.is_empty() {
                entry["env"] = json!(env);
            }
            entry
        }
        Transport::Http { url, headers } => {
            let mut entry = json!({ "type": "http", "url": url });
            if !headers.is_empty() {
                entry["headers"] = json!(headers);
            }
            entry
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn atomic_write_with_tmp(
    path: &Path,
    content: &str,
    tmp: &Path,
) -> Result<WriteOutcome, DestinationError> {
    match std::fs::read(path) {
        Ok(existing) if sha256_hex(&existing) == sha256_hex(content.as_bytes()) => {
            return Ok(WriteOutcome::Unchanged);
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(io_err(path, err)),
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    std::fs::write(tmp, content).map_err(|e| io_err(tmp, e))?;

    if let Err(e) = std::fs::rename(tmp, path) {
        let _ = std::fs::remove_file(tmp);
        return Err(io_err(path, e));
    }
    Ok(WriteOutcome::Written)
}
