//! Debounce state machine for auto-sync.
//!
//! ```text
//!            change                      deadline reached
//!   Idle ───────────▶ Pending{deadline} ─────────────────▶ Syncing{deferred}
//!                      ▲   │ change: deadline = now + delay        │
//!                      │   └──────┘                                │ change: deferred = true
//!                      │                                           │
//!                      └──── sync done, deferred ◀─────────────────┤
//!   Idle ◀──────────────────  sync done, !deferred ◀───────────────┘
//! ```
//!
//! No timer is armed while a sync runs, so two syncs never overlap; a change
//! seen during a sync schedules exactly one follow-up.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    Idle,
    Pending { deadline: Instant },
    Syncing { deferred: bool },
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    state: DebounceState,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            state: DebounceState::Idle,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Record a qualifying change at `now`.
    pub fn on_change(&mut self, now: Instant) {
        self.state = match self.state {
            DebounceState::Idle | DebounceState::Pending { .. } => DebounceState::Pending {
                deadline: now + self.delay,
            },
            DebounceState::Syncing { .. } => DebounceState::Syncing { deferred: true },
        };
    }

    /// When the armed timer expires, if any.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            DebounceState::Pending { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Returns `true` (and enters `Syncing`) when the timer has expired
    /// uninterrupted by `now`; the caller must then run exactly one sync.
    pub fn poll_fire(&mut self, now: Instant) -> bool {
        match self.state {
            DebounceState::Pending { deadline } if now >= deadline => {
                self.state = DebounceState::Syncing { deferred: false };
                true
            }
            _ => false,
        }
    }

    /// The sync started by [`poll_fire`](Self::poll_fire) finished at `now`.
    pub fn on_sync_complete(&mut self, now: Instant) {
        self.state = match self.state {
            DebounceState::Syncing { deferred: true } => DebounceState::Pending {
                deadline: now + self.delay,
            },
            _ => DebounceState::Idle,
        };
    }

    /// Drop any armed timer.
    pub fn cancel(&mut self) {
        if let DebounceState::Pending { .. } = self.state {
            self.state = DebounceState::Idle;
        }
    }
}
