//! In-process publish/subscribe bus.
//!
//! Every subscriber owns a bounded queue. `publish` never blocks: when a
//! subscriber's queue is full the new event is dropped for that subscriber
//! only and counted in [`EventBus::dropped`]. Subscribers whose
//! [`Subscription`] has been dropped are pruned on the next publish.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::types::ServerName;

/// Per-subscriber queue depth used by [`EventBus::new`].
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Coarse grouping used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Config,
    Server,
    Sync,
    Conflict,
    AutoSync,
    File,
    Diagnostic,
}

/// Event payloads, one variant per event type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ConfigLoaded {
        servers: usize,
    },
    ConfigSaved {
        servers: usize,
    },
    ServerAdded {
        name: ServerName,
    },
    ServerUpdated {
        name: ServerName,
    },
    ServerRemoved {
        name: ServerName,
    },
    SyncStarted {
        destination: String,
        dry_run: bool,
    },
    SyncCompleted {
        destination: String,
        changes: usize,
        dry_run: bool,
        duration_ms: u64,
    },
    SyncFailed {
        destination: String,
        error: String,
    },
    ConflictDetected {
        server: ServerName,
        resolution: String,
    },
    AutoSyncStarted {
        debounce_ms: u64,
        destinations: Vec<String>,
    },
    AutoSyncStopped,
    FileChanged {
        path: PathBuf,
    },
    Error {
        message: String,
    },
    Warning {
        message: String,
    },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            EventKind::ConfigLoaded { .. } | EventKind::ConfigSaved { .. } => EventCategory::Config,
            EventKind::ServerAdded { .. }
            | EventKind::ServerUpdated { .. }
            | EventKind::ServerRemoved { .. } => EventCategory::Server,
            EventKind::SyncStarted { .. }
            | EventKind::SyncCompleted { .. }
            | EventKind::SyncFailed { .. } => EventCategory::Sync,
            EventKind::ConflictDetected { .. } => EventCategory::Conflict,
            EventKind::AutoSyncStarted { .. } | EventKind::AutoSyncStopped => {
                EventCategory::AutoSync
            }
            EventKind::FileChanged { .. } => EventCategory::File,
            EventKind::Error { .. } | EventKind::Warning { .. } => EventCategory::Diagnostic,
        }
    }
}

/// A published event: sequence number, timestamp, payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

struct Subscriber {
    id: u64,
    filter: Option<HashSet<EventCategory>>,
    tx: mpsc::Sender<Event>,
}

impl Subscriber {
    fn wants(&self, category: EventCategory) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |set| set.contains(&category))
    }
}

struct BusInner {
    subscribers: Mutex<Vec<Subscriber>>,
    capacity: usize,
    next_seq: AtomicU64,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
                next_seq: AtomicU64::new(1),
                next_id: AtomicU64::new(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe(&self) -> Subscription {
        self.register(None)
    }

    /// Subscribe to the given categories. An empty set means everything.
    pub fn subscribe_to(&self, categories: impl IntoIterator<Item = EventCategory>) -> Subscription {
        let set: HashSet<EventCategory> = categories.into_iter().collect();
        self.register((!set.is_empty()).then_some(set))
    }

    fn register(&self, filter: Option<HashSet<EventCategory>>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    /// Deliver `kind` to every interested subscriber; returns how many got it.
    pub fn publish(&self, kind: EventKind) -> usize {
        let category = kind.category();
        // Sequence numbers are taken under the subscriber lock so delivery
        // order always matches `seq` order.
        let mut subscribers = self.inner.subscribers.lock();
        let event = Event {
            seq: self.inner.next_seq.fetch_add(1, Ordering::Relaxed),
            at: Utc::now(),
            kind,
        };

        let mut delivered = 0usize;
        subscribers.retain(|sub| {
            if !sub.wants(category) {
                return !sub.tx.is_closed();
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(subscriber = sub.id, seq = event.seq, "event queue full, dropping");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Total events dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the next event; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
