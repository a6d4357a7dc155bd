//! Serialized node runtime.
//!
//! A single tokio task owns the [`MeshNode`]. Transport events, API commands
//! and timer ticks are handled one at a time on that task, so the node never
//! needs interior locking.

use std::time::{Duration, Instant};

use serde_json::Value;
use swarm_core::{EventBus, SwarmError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::console;
use crate::node::{MeshNode, NodeStatus, PeerView, StateView};
use crate::transport::TransportEvent;

/// Requests handled by the runtime task.
#[derive(Debug)]
pub enum NodeCommand {
    Status(oneshot::Sender<NodeStatus>),
    Peers(oneshot::Sender<Vec<PeerView>>),
    State(oneshot::Sender<Vec<StateView>>),
    GetState {
        key: String,
        reply: oneshot::Sender<Option<String>>,
    },
    SetState {
        key: String,
        value: String,
        reply: oneshot::Sender<bool>,
    },
    SendCommand {
        payload: Value,
        reply: oneshot::Sender<()>,
    },
    BroadcastState(oneshot::Sender<()>),
    RequestSync(oneshot::Sender<()>),
    PushTelemetry(oneshot::Sender<bool>),
    Console {
        line: String,
        reply: oneshot::Sender<String>,
    },
    Shutdown,
}

/// Cloneable handle for talking to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    tx: mpsc::Sender<NodeCommand>,
    events: EventBus,
}

impl NodeHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> swarm_core::Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SwarmError::RuntimeStopped)?;
        rx.await.map_err(|_| SwarmError::RuntimeStopped)
    }

    pub async fn status(&self) -> swarm_core::Result<NodeStatus> {
        self.request(NodeCommand::Status).await
    }

    pub async fn peers(&self) -> swarm_core::Result<Vec<PeerView>> {
        self.request(NodeCommand::Peers).await
    }

    pub async fn state(&self) -> swarm_core::Result<Vec<StateView>> {
        self.request(NodeCommand::State).await
    }

    pub async fn get_state(&self, key: impl Into<String>) -> swarm_core::Result<Option<String>> {
        let key = key.into();
        self.request(|reply| NodeCommand::GetState { key, reply })
            .await
    }

    pub async fn set_state(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> swarm_core::Result<bool> {
        let (key, value) = (key.into(), value.into());
        self.request(|reply| NodeCommand::SetState { key, value, reply })
            .await
    }

    pub async fn send_command(&self, payload: Value) -> swarm_core::Result<()> {
        self.request(|reply| NodeCommand::SendCommand { payload, reply })
            .await
    }

    pub async fn broadcast_state(&self) -> swarm_core::Result<()> {
        self.request(NodeCommand::BroadcastState).await
    }

    pub async fn request_sync(&self) -> swarm_core::Result<()> {
        self.request(NodeCommand::RequestSync).await
    }

    pub async fn push_telemetry(&self) -> swarm_core::Result<bool> {
        self.request(NodeCommand::PushTelemetry).await
    }

    pub async fn console(&self, line: impl Into<String>) -> swarm_core::Result<String> {
        let line = line.into();
        self.request(|reply| NodeCommand::Console { line, reply })
            .await
    }

    /// Ask the runtime to stop. Succeeds even if it already has.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(NodeCommand::Shutdown).await;
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }
}

/// Move `node` onto its own task and start processing.
pub fn spawn(
    node: MeshNode,
    events: mpsc::Receiver<TransportEvent>,
    tick: Duration,
) -> (NodeHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = NodeHandle {
        tx,
        events: node.events().clone(),
    };
    let task = tokio::spawn(run(node, events, rx, tick));
    (handle, task)
}

async fn run(
    mut node: MeshNode,
    mut events: mpsc::Receiver<TransportEvent>,
    mut commands: mpsc::Receiver<NodeCommand>,
    tick: Duration,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(node = %node.name(), tick_ms = tick.as_millis() as u64, "mesh runtime started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => node.handle_event(event),
                None => {
                    warn!("transport event stream closed");
                    break;
                }
            },

            cmd = commands.recv() => match cmd {
                Some(NodeCommand::Shutdown) | None => break,
                Some(cmd) => apply(&mut node, cmd),
            },

            _ = interval.tick() => node.tick(Instant::now()),
        }
    }

    node.shutdown();
}

fn apply(node: &mut MeshNode, cmd: NodeCommand) {
    // Replies are dropped silently if the caller went away.
    match cmd {
        NodeCommand::Status(reply) => {
            let _ = reply.send(node.status());
        }
        NodeCommand::Peers(reply) => {
            let _ = reply.send(node.peer_views());
        }
        NodeCommand::State(reply) => {
            let _ = reply.send(node.state_views());
        }
        NodeCommand::GetState { key, reply } => {
            let _ = reply.send(node.state().get(&key).map(|e| e.value.clone()));
        }
        NodeCommand::SetState { key, value, reply } => {
            let _ = reply.send(node.set_state(&key, &value));
        }
        NodeCommand::SendCommand { payload, reply } => {
            node.send_command(payload);
            let _ = reply.send(());
        }
        NodeCommand::BroadcastState(reply) => {
            node.broadcast_full_state();
            let _ = reply.send(());
        }
        NodeCommand::RequestSync(reply) => {
            node.request_state_sync();
            let _ = reply.send(());
        }
        NodeCommand::PushTelemetry(reply) => {
            let _ = reply.send(node.push_telemetry());
        }
        NodeCommand::Console { line, reply } => {
            let _ = reply.send(console::execute(node, &line));
        }
        NodeCommand::Shutdown => {}
    }
}
