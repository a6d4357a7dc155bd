//! libp2p transport: TCP with Noise encryption and Yamux multiplexing,
//! GossipSub for broadcast and optional mDNS for LAN discovery.
//!
//! Node ids are derived from the libp2p `PeerId`: the first four bytes of its
//! blake3 digest, read big-endian.
//!
//! `connected_nodes` lists direct connections only. GossipSub still relays
//! messages across hops, but election sees just the neighbours: in a chain
//! A-B-C, A and C each elect from their own view and can disagree on the
//! coordinator. Nodes on one LAN with mDNS enabled dial each other directly
//! and form a full mesh, so their views agree.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    Multiaddr, PeerId, Swarm, gossipsub, mdns, noise,
    swarm::{NetworkBehaviour, SwarmEvent, behaviour::toggle::Toggle},
    tcp, yamux,
};
use parking_lot::RwLock;
use swarm_core::{NodeId, SwarmError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{EVENT_CHANNEL_CAPACITY, Transport, TransportEvent};

/// Map a libp2p peer to its mesh node id.
pub fn node_id_for(peer: &PeerId) -> NodeId {
    let digest = blake3::hash(&peer.to_bytes());
    let b = digest.as_bytes();
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

/// Settings for [`start`].
#[derive(Debug, Clone)]
pub struct P2pOptions {
    pub listen: String,
    pub bootstrap_peers: Vec<String>,
    pub mdns: bool,
    pub topic: String,
}

impl From<&swarm_config::MeshConfig> for P2pOptions {
    fn from(cfg: &swarm_config::MeshConfig) -> Self {
        Self {
            listen: cfg.listen.clone(),
            bootstrap_peers: cfg.bootstrap_peers.clone(),
            mdns: cfg.mdns,
            topic: cfg.topic.clone(),
        }
    }
}

/// Commands sent from the transport handle to the swarm task.
#[derive(Debug)]
enum SwarmCommand {
    Publish(Vec<u8>),
    Shutdown,
}

#[derive(NetworkBehaviour)]
struct MeshBehaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: Toggle<mdns::tokio::Behaviour>,
}

/// Handle on a running libp2p swarm.
pub struct P2pTransport {
    node_id: NodeId,
    peer_id: PeerId,
    connected: Arc<RwLock<BTreeSet<NodeId>>>,
    command_tx: mpsc::Sender<SwarmCommand>,
}

impl P2pTransport {
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl Transport for P2pTransport {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn connected_nodes(&self) -> Vec<NodeId> {
        self.connected.read().iter().copied().collect()
    }

    fn broadcast(&mut self, payload: String) {
        if let Err(e) = self
            .command_tx
            .try_send(SwarmCommand::Publish(payload.into_bytes()))
        {
            warn!(error = %e, "mesh publish queue full or closed, message dropped");
        }
    }

    fn shutdown(&mut self) {
        let _ = self.command_tx.try_send(SwarmCommand::Shutdown);
    }
}

/// Build the swarm, start listening and spawn its event loop.
pub async fn start(
    options: P2pOptions,
) -> swarm_core::Result<(P2pTransport, mpsc::Receiver<TransportEvent>)> {
    let mut swarm = build_swarm(options.mdns)
        .map_err(|e| SwarmError::Transport(format!("failed to build libp2p swarm: {e}")))?;

    let peer_id = *swarm.local_peer_id();
    let node_id = node_id_for(&peer_id);
    info!(peer_id = %peer_id, node_id = %format!("{node_id:08x}"), "libp2p identity created");

    let addr: Multiaddr = options
        .listen
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| SwarmError::InvalidAddress {
            addr: options.listen.clone(),
            reason: e.to_string(),
        })?;
    swarm
        .listen_on(addr)
        .map_err(|e| SwarmError::Transport(format!("failed to listen: {e}")))?;

    for peer_addr in &options.bootstrap_peers {
        match peer_addr.parse::<Multiaddr>() {
            Ok(addr) => {
                info!(addr = %addr, "dialing bootstrap peer");
                if let Err(e) = swarm.dial(addr) {
                    warn!(error = %e, "failed to dial bootstrap peer");
                }
            }
            Err(e) => {
                warn!(addr = %peer_addr, error = %e, "invalid bootstrap peer address, skipping");
            }
        }
    }

    let topic = gossipsub::IdentTopic::new(options.topic.clone());
    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&topic)
        .map_err(|e| SwarmError::Transport(format!("failed to subscribe to {topic}: {e}")))?;

    let (command_tx, command_rx) = mpsc::channel(256);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let connected = Arc::new(RwLock::new(BTreeSet::new()));

    tokio::spawn(run_swarm_loop(
        swarm,
        topic,
        event_tx,
        command_rx,
        connected.clone(),
    ));

    Ok((
        P2pTransport {
            node_id,
            peer_id,
            connected,
            command_tx,
        },
        event_rx,
    ))
}

fn build_swarm(
    enable_mdns: bool,
) -> std::result::Result<Swarm<MeshBehaviour>, Box<dyn std::error::Error + Send + Sync>> {
    let swarm = libp2p::SwarmBuilder::with_new_identity()
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_behaviour(|key| {
            // Periodic full-state sync repeats identical payloads, so message
            // ids must not be content-addressed.
            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .max_transmit_size(256 * 1024)
                .build()
                .map_err(|e| std::io::Error::other(e.to_string()))?;

            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )
            .map_err(|e| std::io::Error::other(e.to_string()))?;

            let mdns = if enable_mdns {
                Some(mdns::tokio::Behaviour::new(
                    mdns::Config::default(),
                    key.public().to_peer_id(),
                )?)
            } else {
                None
            };

            Ok(MeshBehaviour {
                gossipsub,
                mdns: Toggle::from(mdns),
            })
        })?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

async fn run_swarm_loop(
    mut swarm: Swarm<MeshBehaviour>,
    topic: gossipsub::IdentTopic,
    event_tx: mpsc::Sender<TransportEvent>,
    mut command_rx: mpsc::Receiver<SwarmCommand>,
    connected: Arc<RwLock<BTreeSet<NodeId>>>,
) {
    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                if !handle_swarm_event(&mut swarm, &event_tx, &connected, event).await {
                    break;
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(SwarmCommand::Publish(data)) => {
                        if let Err(e) = swarm.behaviour_mut().gossipsub.publish(topic.clone(), data) {
                            // InsufficientPeers is normal while alone.
                            debug!(error = %e, "gossipsub publish failed");
                        }
                    }
                    Some(SwarmCommand::Shutdown) | None => {
                        info!("mesh swarm shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle one swarm event. Returns false once the event receiver is gone.
async fn handle_swarm_event(
    swarm: &mut Swarm<MeshBehaviour>,
    event_tx: &mpsc::Sender<TransportEvent>,
    connected: &RwLock<BTreeSet<NodeId>>,
    event: SwarmEvent<MeshBehaviourEvent>,
) -> bool {
    let mut outbound = Vec::new();

    match event {
        SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
            for (peer_id, addr) in list {
                info!(peer = %peer_id, addr = %addr, "mDNS discovered peer");
                swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                if !swarm.is_connected(&peer_id)
                    && let Err(e) = swarm.dial(addr)
                {
                    debug!(peer = %peer_id, error = %e, "dial after mDNS discovery failed");
                }
            }
        }

        SwarmEvent::Behaviour(MeshBehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
            for (peer_id, _addr) in list {
                debug!(peer = %peer_id, "mDNS peer expired");
                swarm
                    .behaviour_mut()
                    .gossipsub
                    .remove_explicit_peer(&peer_id);
            }
        }

        SwarmEvent::Behaviour(MeshBehaviourEvent::Gossipsub(gossipsub::Event::Message {
            propagation_source,
            message,
            ..
        })) => {
            let source = message.source.unwrap_or(propagation_source);
            match String::from_utf8(message.data) {
                Ok(payload) => outbound.push(TransportEvent::Message {
                    from: node_id_for(&source),
                    payload,
                }),
                Err(e) => warn!(peer = %source, error = %e, "non-UTF-8 mesh payload dropped"),
            }
        }

        SwarmEvent::NewListenAddr { address, .. } => {
            info!(addr = %address, "mesh node listening");
        }

        SwarmEvent::ConnectionEstablished {
            peer_id,
            num_established,
            ..
        } => {
            if num_established.get() == 1 {
                let id = node_id_for(&peer_id);
                info!(peer = %peer_id, node_id = %format!("{id:08x}"), "mesh connection established");
                connected.write().insert(id);
                outbound.push(TransportEvent::PeerConnected(id));
                outbound.push(TransportEvent::TopologyChanged);
            }
        }

        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            cause,
            ..
        } => {
            if num_established == 0 {
                let id = node_id_for(&peer_id);
                info!(peer = %peer_id, cause = ?cause, "mesh connection closed");
                connected.write().remove(&id);
                outbound.push(TransportEvent::PeerDropped(id));
                outbound.push(TransportEvent::TopologyChanged);
            }
        }

        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
            warn!(peer = ?peer_id, error = %error, "outgoing connection error");
        }

        _ => {}
    }

    for event in outbound {
        if event_tx.send(event).await.is_err() {
            warn!("transport event receiver dropped, stopping");
            return false;
        }
    }
    true
}
