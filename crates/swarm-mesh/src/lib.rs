//! # swarm-mesh
//!
//! Self-organizing mesh of small nodes. Every node keeps a replica of a shared
//! key-value map merged with last-writer-wins, tracks its peers, and agrees on
//! the lowest-id node as coordinator. A gateway node relays telemetry from
//! the mesh to an HTTP collection server.
//!
//! Transports are pluggable: [`transport::MemoryHub`] links nodes inside one
//! process, [`transport::p2p`] runs over libp2p GossipSub.

pub mod console;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod transport;

pub use node::{MeshNode, NodeSettings, NodeStats, NodeStatus, PeerView, StateView};
pub use peers::{Election, Identity, Peer, PeerDirectory, elect};
pub use protocol::{MeshMessage, StateUpdate};
pub use runtime::{NodeCommand, NodeHandle};
pub use state::{MergeOutcome, StateChange, StateEntry, StateStore, WILDCARD, WriteQueue};
pub use telemetry::{HttpTelemetrySink, RelayMode, TelemetryReport, TelemetrySink};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportEvent};
