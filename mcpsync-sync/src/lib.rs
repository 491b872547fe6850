//! # mcpsync-sync
//!
//! Diff / transform / write pipeline per destination, plus concurrent
//! fan-out across destinations.
//!
//! Call [`syncer::sync_to`] for a single [`Destination`], or
//! [`orchestrator::sync_to_multiple`] to run several concurrently. The
//! [`SyncService`] bundles the config store, the destination registry and
//! the event bus for long-lived hosts such as the daemon.

pub mod destination;
pub mod diff;
pub mod error;
pub mod file_destination;
pub mod orchestrator;
pub mod registry;
pub mod result;
pub mod service;
pub mod syncer;

pub use destination::{Destination, ServerEntries};
pub use error::{DestinationError, SyncError};
pub use file_destination::{FileDestinationSpec, JsonFileDestination};
pub use registry::{DestinationInfo, DestinationRegistry};
pub use result::{Change, ChangeKind, MultiSyncResult, SyncIssue, SyncOptions, SyncResult};
pub use service::{SyncPreview, SyncService};
