//! Process-local view of leadership.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::telemetry::LifecycleMetrics;

/// Last two leadership observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LeaderElectionState {
    pub currently_leader: bool,
    pub last_known_leader: bool,
}

/// A change in leadership between two observations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Acquired,
    Lost,
}

struct Inner {
    state: Mutex<LeaderElectionState>,
    notify: watch::Sender<bool>,
}

/// Shared leadership state, written by the poll loop and read by anyone.
///
/// Observing a value reads the previous state, decides the transition and
/// stores the new state under one lock, so concurrent observers cannot report
/// the same transition twice or miss one.
#[derive(Clone)]
pub struct LeadershipTracker {
    inner: Arc<Inner>,
}

impl LeadershipTracker {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(LeaderElectionState::default()),
                notify,
            }),
        }
    }

    /// Record an answer from the elector and return the transition it caused.
    pub fn observe(&self, is_lead: bool) -> Option<Transition> {
        let mut state = self.inner.state.lock();
        let was_lead = state.currently_leader;
        state.last_known_leader = was_lead;
        state.currently_leader = is_lead;

        let transition = match (was_lead, is_lead) {
            (false, true) => Transition::Acquired,
            (true, false) => Transition::Lost,
            _ => return None,
        };

        self.inner.notify.send_replace(is_lead);
        LifecycleMetrics::leadership_changed(is_lead);
        info!(leader = is_lead, "Leadership changed");

        Some(transition)
    }

    pub fn is_leader(&self) -> bool {
        self.inner.state.lock().currently_leader
    }

    pub fn state(&self) -> LeaderElectionState {
        *self.inner.state.lock()
    }

    /// Receiver that sees every leadership change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.notify.subscribe()
    }
}

impl Default for LeadershipTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LeadershipTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeadershipTracker")
            .field("state", &self.state())
            .finish()
    }
}
