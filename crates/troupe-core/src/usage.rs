//! Process-wide token accounting.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::Usage;

/// Snapshot of the running totals, broadcast after every increment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageStats {
    pub session: Usage,
    pub lifetime: Usage,
    pub last_updated: Option<DateTime<Utc>>,
}

struct TrackerState {
    session: Usage,
    lifetime: Usage,
    last_updated: Option<DateTime<Utc>>,
}

/// Accumulates token usage across every completion in the process.
///
/// Increments are serialized: the read-modify-write of both totals and the
/// listener notification happen under one lock, so snapshots never interleave
/// mid-update.
pub struct UsageTracker {
    state: Mutex<TrackerState>,
    updates: broadcast::Sender<UsageStats>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(TrackerState {
                session: Usage::default(),
                lifetime: Usage::default(),
                last_updated: None,
            }),
            updates,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(state: &TrackerState) -> UsageStats {
        UsageStats {
            session: state.session,
            lifetime: state.lifetime,
            last_updated: state.last_updated,
        }
    }

    /// Add one completion's usage to both totals and notify subscribers.
    pub fn add(&self, usage: &Usage) {
        let mut state = self.lock_state();
        state.session.add(usage);
        state.lifetime.add(usage);
        state.last_updated = Some(Utc::now());
        // Ignore send errors (no subscribers)
        let _ = self.updates.send(Self::snapshot(&state));
    }

    pub fn stats(&self) -> UsageStats {
        Self::snapshot(&self.lock_state())
    }

    pub fn reset_session(&self) {
        let mut state = self.lock_state();
        state.session = Usage::default();
        let _ = self.updates.send(Self::snapshot(&state));
    }

    pub fn reset_all(&self) {
        let mut state = self.lock_state();
        state.session = Usage::default();
        state.lifetime = Usage::default();
        state.last_updated = None;
        let _ = self.updates.send(Self::snapshot(&state));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UsageStats> {
        self.updates.subscribe()
    }
}
