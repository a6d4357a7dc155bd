use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{NodeId, Role};

/// Observable lifecycle events emitted by a mesh node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Membership ─────────────────────────────────────────────
    PeerConnected {
        node_id: NodeId,
    },
    PeerDropped {
        node_id: NodeId,
    },
    PeerPruned {
        node_id: NodeId,
    },
    RoleChanged {
        from: Role,
        to: Role,
        coordinator_id: NodeId,
    },

    // ── Shared state ───────────────────────────────────────────
    StateChanged {
        key: String,
        value: String,
        old_value: String,
        origin: NodeId,
    },

    // ── Telemetry ──────────────────────────────────────────────
    TelemetryDelivered {
        node_id: NodeId,
    },
    TelemetryFailed {
        node_id: NodeId,
        reason: String,
    },

    Shutdown,
}

/// A broadcast-based event bus for node lifecycle observers.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
