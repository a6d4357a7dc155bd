//! Peer directory and coordinator election.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use swarm_core::{NodeId, Role, node_name};
use tracing::{debug, info};

/// A node known to the local directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    pub last_seen: Instant,
    pub alive: bool,
}

/// The local node's identity and current election result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    pub coordinator_id: NodeId,
}

impl Identity {
    /// A fresh identity starts as its own coordinator until the first
    /// election says otherwise.
    pub fn new(id: NodeId, name: Option<String>) -> Self {
        Self {
            id,
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| node_name(id)),
            role: Role::Coordinator,
            coordinator_id: id,
        }
    }
}

/// Result of one election pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Election {
    pub coordinator_id: NodeId,
    pub role: Role,
}

/// Lowest id among the local node and the currently connected nodes wins.
pub fn elect(local: NodeId, connected: &[NodeId]) -> Election {
    let coordinator_id = connected.iter().copied().fold(local, NodeId::min);
    let role = if coordinator_id == local {
        Role::Coordinator
    } else {
        Role::Peer
    };
    Election {
        coordinator_id,
        role,
    }
}

/// Tracks peers seen on the mesh.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: BTreeMap<NodeId, Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a peer from a received heartbeat.
    pub fn record_heartbeat(&mut self, id: NodeId, name: &str, role: Role, now: Instant) {
        let is_new = !self.peers.contains_key(&id);
        self.peers.insert(
            id,
            Peer {
                id,
                name: name.to_string(),
                role,
                last_seen: now,
                alive: true,
            },
        );
        if is_new {
            info!(peer = %name, id = id, role = %role, "peer joined");
        }
    }

    /// Ensure an entry exists for a freshly connected node.
    pub fn record_connected(&mut self, id: NodeId, now: Instant) {
        self.peers
            .entry(id)
            .and_modify(|p| {
                p.alive = true;
                p.last_seen = now;
            })
            .or_insert_with(|| Peer {
                id,
                name: node_name(id),
                role: Role::Peer,
                last_seen: now,
                alive: true,
            });
    }

    /// Mark a peer as dropped. The entry stays until pruned.
    pub fn mark_dropped(&mut self, id: NodeId) {
        if let Some(peer) = self.peers.get_mut(&id) {
            peer.alive = false;
            info!(peer = %peer.name, id = id, "peer dropped");
        }
    }

    /// Delete peers not heard from within `timeout`. Returns the removed ids.
    pub fn prune(&mut self, now: Instant, timeout: Duration) -> Vec<NodeId> {
        let stale: Vec<NodeId> = self
            .peers
            .values()
            .filter(|p| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|p| p.id)
            .collect();
        for id in &stale {
            if let Some(peer) = self.peers.remove(id) {
                debug!(peer = %peer.name, id = id, "pruned stale peer");
            }
        }
        stale
    }

    pub fn alive_count(&self) -> usize {
        self.peers.values().filter(|p| p.alive).count()
    }

    pub fn get(&self, id: NodeId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_election_lowest_id_wins() {
        assert_eq!(
            elect(7, &[3, 9]),
            Election {
                coordinator_id: 3,
                role: Role::Peer
            }
        );
        assert_eq!(elect(3, &[7, 9]).role, Role::Coordinator);
        assert_eq!(elect(9, &[7, 3]).coordinator_id, 3);
    }

    #[test]
    fn test_election_alone_is_coordinator() {
        assert_eq!(
            elect(42, &[]),
            Election {
                coordinator_id: 42,
                role: Role::Coordinator
            }
        );
    }

    #[test]
    fn test_identity_default_name() {
        let id = Identity::new(0xDEAD_BEEF, None);
        assert_eq!(id.name, "NBEEF");
        assert_eq!(Identity::new(1, Some("  ".into())).name, "N1");
        assert_eq!(Identity::new(1, Some("Light".into())).name, "Light");
    }

    #[test]
    fn test_prune_removes_only_stale_peers() {
        let mut dir = PeerDirectory::new();
        let start = Instant::now();
        dir.record_heartbeat(1, "old", Role::Peer, start);
        dir.record_heartbeat(2, "fresh", Role::Peer, start + Duration::from_secs(10));

        let now = start + Duration::from_secs(16);
        let removed = dir.prune(now, Duration::from_secs(15));
        assert_eq!(removed, vec![1]);
        assert!(dir.get(1).is_none());
        assert!(dir.get(2).is_some());
    }

    #[test]
    fn test_prune_keeps_peer_at_exact_timeout() {
        let mut dir = PeerDirectory::new();
        let start = Instant::now();
        dir.record_heartbeat(1, "edge", Role::Peer, start);
        assert!(
            dir.prune(start + Duration::from_secs(15), Duration::from_secs(15))
                .is_empty()
        );
    }

    #[test]
    fn test_dropped_peer_not_counted_but_listed() {
        let mut dir = PeerDirectory::new();
        let now = Instant::now();
        dir.record_connected(4, now);
        dir.record_heartbeat(5, "B", Role::Coordinator, now);
        dir.mark_dropped(4);
        assert_eq!(dir.alive_count(), 1);
        assert_eq!(dir.len(), 2);
        assert_eq!(dir.get(4).unwrap().name, "N4");
    }
}
