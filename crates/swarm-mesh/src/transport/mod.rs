//! Broadcast transports that carry encoded mesh messages.
//!
//! A transport exposes the local node id, the ids it currently has live
//! connections to, and a best-effort broadcast. Inbound traffic and topology
//! changes arrive separately as [`TransportEvent`]s on an mpsc channel.

pub mod memory;
pub mod p2p;

use swarm_core::NodeId;

pub use memory::{MemoryHub, MemoryTransport};
pub use p2p::{P2pOptions, P2pTransport};

/// Capacity of the event channel handed out by transports.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Something that happened on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Message { from: NodeId, payload: String },
    PeerConnected(NodeId),
    PeerDropped(NodeId),
    TopologyChanged,
}

/// Outbound side of a mesh transport.
pub trait Transport: Send {
    fn node_id(&self) -> NodeId;

    /// Ids of nodes with a live connection right now.
    fn connected_nodes(&self) -> Vec<NodeId>;

    /// Deliver `payload` to every connected node. Failures are logged, not
    /// returned.
    fn broadcast(&mut self, payload: String);

    /// Stop background work owned by the transport.
    fn shutdown(&mut self) {}
}
