//! Sync options and results.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Knobs for one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Compute the diff but write nothing (and take no backup).
    #[serde(default)]
    pub dry_run: bool,
    /// Back the destination up before overwriting existing content.
    #[serde(default)]
    pub backup: bool,
}

impl SyncOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            backup: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Add,
    Update,
    Remove,
}

/// One diff entry between the destination's content and the new content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
}

/// An error recorded against a destination. Recoverable issues do not make
/// the sync fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub destination: String,
    pub success: bool,
    pub dry_run: bool,
    #[serde(default)]
    pub changes: Vec<Change>,
    #[serde(default)]
    pub errors: Vec<SyncIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<PathBuf>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl SyncResult {
    pub(crate) fn begin(destination: &str, dry_run: bool) -> Self {
        Self {
            destination: destination.to_string(),
            success: false,
            dry_run,
            changes: Vec::new(),
            errors: Vec::new(),
            backup_path: None,
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    /// A result for a destination whose sync never produced one of its own.
    pub fn failed(destination: &str, dry_run: bool, message: impl Into<String>) -> Self {
        let mut result = Self::begin(destination, dry_run);
        result.errors.push(SyncIssue {
            message: message.into(),
            recoverable: false,
        });
        result
    }

    pub(crate) fn finish(mut self, elapsed: Duration) -> Self {
        self.success = self.errors.iter().all(|e| e.recoverable);
        self.duration_ms = elapsed.as_millis() as u64;
        self
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// First non-recoverable error, if any.
    pub fn fatal_error(&self) -> Option<&str> {
        self.errors
            .iter()
            .find(|e| !e.recoverable)
            .map(|e| e.message.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiSyncResult {
    pub results: Vec<SyncResult>,
    pub success_count: usize,
    pub failure_count: usize,
    pub duration_ms: u64,
}

impl MultiSyncResult {
    pub(crate) fn from_results(mut results: Vec<SyncResult>, elapsed: Duration) -> Self {
        results.sort_by(|a, b| a.destination.cmp(&b.destination));
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            failure_count: results.len() - success_count,
            success_count,
            results,
            duration_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn get(&self, destination: &str) -> Option<&SyncResult> {
        self.results.iter().find(|r| r.destination == destination)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failure_count == 0
    }
}
