//! mcpsync core library: server config model, storage, config store, events.
//!
//! Public API surface:
//! - [`types`]: newtypes and the [`Config`] document
//! - [`storage`]: the [`Storage`] backend contract plus file and memory backends
//! - [`store`]: [`ConfigStore`], the lock-guarded owner of the live config
//! - [`validate`]: pluggable validation / name sanitization hooks
//! - [`events`]: the in-process [`EventBus`]

pub mod error;
pub mod events;
pub mod storage;
pub mod store;
pub mod types;
pub mod validate;

pub use error::{StorageError, StoreError};
pub use events::{Event, EventBus, EventCategory, EventKind, Subscription};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use store::{ConfigStore, MergeReport, CONFIG_KEY};
pub use types::{
    AutoSyncSettings, Config, ConfigMetadata, ServerConfig, ServerName, Transport, TransportKind,
};
pub use validate::{BasicValidator, NameSanitizer, ServerValidator, TrimSanitizer};
