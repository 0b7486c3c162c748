//! Presence tracking
//!
//! A reducer over `Presence` heartbeats. It performs no polling of its own and
//! is consulted only when a call is initiated.

use crate::identity::ParticipantId;
use std::collections::BTreeSet;

/// Set of currently reachable participants
#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    online: BTreeSet<ParticipantId>,
}

impl PresenceTracker {
    /// Create an empty tracker
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a heartbeat; returns whether reachability changed
    pub fn apply(&mut self, id: &ParticipantId, is_online: bool) -> bool {
        let changed = if is_online {
            self.online.insert(id.clone())
        } else {
            self.online.remove(id)
        };
        if changed {
            tracing::debug!(participant = %id, is_online, "Presence changed");
        }
        changed
    }

    /// Whether `id` is currently reachable
    #[must_use]
    pub fn is_reachable(&self, id: &ParticipantId) -> bool {
        self.online.contains(id)
    }

    /// Reachable participants, sorted
    #[must_use]
    pub fn online(&self) -> Vec<ParticipantId> {
        self.online.iter().cloned().collect()
    }
}
