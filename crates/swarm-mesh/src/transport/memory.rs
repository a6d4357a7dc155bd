//! In-process transport. Several nodes share a [`MemoryHub`]; links between
//! them are opened and closed explicitly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use swarm_core::NodeId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};

#[derive(Default)]
struct HubInner {
    inboxes: BTreeMap<NodeId, mpsc::Sender<TransportEvent>>,
    links: BTreeSet<(NodeId, NodeId)>,
}

impl HubInner {
    fn neighbours(&self, id: NodeId) -> Vec<NodeId> {
        self.links
            .iter()
            .filter_map(|&(a, b)| match (a == id, b == id) {
                (true, _) => Some(b),
                (_, true) => Some(a),
                _ => None,
            })
            .collect()
    }

    fn send(&self, to: NodeId, event: TransportEvent) {
        if let Some(tx) = self.inboxes.get(&to)
            && let Err(e) = tx.try_send(event)
        {
            warn!(to = to, error = %e, "memory hub dropped event");
        }
    }
}

/// Shared switchboard for [`MemoryTransport`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    (a.min(b), a.max(b))
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node and return its transport plus event stream.
    pub fn join(&self, id: NodeId) -> (MemoryTransport, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.inner.lock().inboxes.insert(id, tx);
        debug!(id = id, "node joined memory hub");
        (
            MemoryTransport {
                id,
                hub: self.clone(),
            },
            rx,
        )
    }

    /// Open a link between two nodes. Both sides see `PeerConnected` followed
    /// by `TopologyChanged`.
    pub fn connect(&self, a: NodeId, b: NodeId) {
        if a == b {
            return;
        }
        let mut inner = self.inner.lock();
        if !inner.links.insert(link(a, b)) {
            return;
        }
        for (me, other) in [(a, b), (b, a)] {
            inner.send(me, TransportEvent::PeerConnected(other));
            inner.send(me, TransportEvent::TopologyChanged);
        }
    }

    /// Close a link. Both sides see `PeerDropped` followed by `TopologyChanged`.
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.lock();
        if !inner.links.remove(&link(a, b)) {
            return;
        }
        for (me, other) in [(a, b), (b, a)] {
            inner.send(me, TransportEvent::PeerDropped(other));
            inner.send(me, TransportEvent::TopologyChanged);
        }
    }

    /// Remove a node and all of its links.
    pub fn leave(&self, id: NodeId) {
        let neighbours = self.inner.lock().neighbours(id);
        for other in neighbours {
            self.disconnect(id, other);
        }
        self.inner.lock().inboxes.remove(&id);
    }

    pub fn connected(&self, id: NodeId) -> Vec<NodeId> {
        self.inner.lock().neighbours(id)
    }
}

/// One node's handle on a [`MemoryHub`].
pub struct MemoryTransport {
    id: NodeId,
    hub: MemoryHub,
}

impl Transport for MemoryTransport {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn connected_nodes(&self) -> Vec<NodeId> {
        self.hub.connected(self.id)
    }

    fn broadcast(&mut self, payload: String) {
        let inner = self.hub.inner.lock();
        for to in inner.neighbours(self.id) {
            inner.send(
                to,
                TransportEvent::Message {
                    from: self.id,
                    payload: payload.clone(),
                },
            );
        }
    }
}
