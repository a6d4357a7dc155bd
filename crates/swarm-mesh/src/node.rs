//! The mesh node: one owned context tying the transport, codec, state store,
//! peer directory and telemetry relay together.
//!
//! Every method runs to completion. Callers that need concurrency go through
//! [`crate::runtime`], which owns the node on a single task.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{Value, json};
use swarm_config::SwarmConfig;
use swarm_core::{Event, EventBus, NodeId, Role};
use tracing::{debug, info, warn};

use crate::peers::{Election, Identity, Peer, PeerDirectory, elect};
use crate::protocol::{
    self, Decoded, Envelope, HEARTBEAT_RESERVED_KEYS, Heartbeat, MeshMessage, StateUpdate,
};
use crate::state::{MergeOutcome, StateChange, StateStore, WriteQueue};
use crate::telemetry::{RelayMode, TelemetryRelay, TelemetryReport, TelemetrySink};
use crate::transport::{Transport, TransportEvent};

/// Upper bound on queued writes applied in one step. Protects against
/// watchers that keep rewriting each other's keys.
pub const MAX_QUEUED_WRITES: usize = 64;

pub type CommandHandler = Box<dyn FnMut(NodeId, &Value, &mut WriteQueue) -> Option<Value> + Send>;
pub type ResponseHandler = Box<dyn FnMut(NodeId, &Value) + Send>;
pub type ConsoleHandler = Box<dyn FnMut(&str, &mut WriteQueue) -> Option<String> + Send>;
pub type LoopHook = Box<dyn FnMut(&mut WriteQueue) + Send>;

/// Node behaviour knobs, normally derived from [`SwarmConfig`].
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub name: Option<String>,
    pub firmware: String,
    pub heartbeat_interval: Duration,
    pub state_sync_interval: Duration,
    pub peer_timeout: Duration,
    pub telemetry_enabled: bool,
    pub gateway: bool,
    pub telemetry_interval: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from_config(&SwarmConfig::default())
    }
}

impl NodeSettings {
    pub fn from_config(config: &SwarmConfig) -> Self {
        Self {
            name: config.node.name.clone(),
            firmware: config.node.firmware_version.clone(),
            heartbeat_interval: config.timing.heartbeat_interval(),
            state_sync_interval: config.timing.state_sync_interval(),
            peer_timeout: config.timing.peer_timeout(),
            telemetry_enabled: config.telemetry.enabled,
            gateway: config.telemetry.gateway,
            telemetry_interval: config.telemetry.interval(),
        }
    }
}

/// Message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    pub messages_received: u64,
    pub messages_sent: u64,
    pub decode_errors: u64,
    pub unknown_messages: u64,
}

/// Point-in-time summary of the node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub id_hex: String,
    pub name: String,
    pub role: Role,
    pub coordinator_id: NodeId,
    pub peer_count: usize,
    pub state_count: usize,
    pub uptime_secs: u64,
    pub free_memory: u64,
    pub firmware: String,
    pub telemetry_enabled: bool,
    pub gateway: bool,
    pub stats: NodeStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerView {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    pub alive: bool,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateView {
    pub key: String,
    pub value: String,
    pub version: u32,
    pub origin: NodeId,
}

pub struct MeshNode {
    transport: Box<dyn Transport>,
    identity: Identity,
    settings: NodeSettings,
    store: StateStore,
    peers: PeerDirectory,
    relay: TelemetryRelay,
    events: EventBus,
    heartbeat_extra: Vec<(String, i64)>,
    command_handlers: Vec<CommandHandler>,
    response_handlers: Vec<ResponseHandler>,
    console_handlers: Vec<ConsoleHandler>,
    loop_hooks: Vec<LoopHook>,
    memory_probe: Box<dyn Fn() -> u64 + Send>,
    started: Instant,
    last_heartbeat: Option<Instant>,
    last_full_sync: Instant,
    stats: NodeStats,
}

impl MeshNode {
    pub fn new(transport: Box<dyn Transport>, settings: NodeSettings) -> Self {
        let now = Instant::now();
        let mut identity = Identity::new(transport.node_id(), settings.name.clone());
        let Election {
            coordinator_id,
            role,
        } = elect(identity.id, &transport.connected_nodes());
        identity.coordinator_id = coordinator_id;
        identity.role = role;

        let mode = if settings.gateway {
            RelayMode::Gateway
        } else {
            RelayMode::Client
        };
        let relay = TelemetryRelay::new(
            settings.telemetry_enabled,
            mode,
            settings.telemetry_interval,
            now,
        );

        info!(
            id = %format!("{:08x}", identity.id),
            name = %identity.name,
            role = %identity.role,
            gateway = settings.gateway,
            "mesh node created"
        );

        Self {
            transport,
            identity,
            settings,
            store: StateStore::new(),
            peers: PeerDirectory::new(),
            relay,
            events: EventBus::default(),
            heartbeat_extra: Vec::new(),
            command_handlers: Vec::new(),
            response_handlers: Vec::new(),
            console_handlers: Vec::new(),
            loop_hooks: Vec::new(),
            memory_probe: Box::new(|| 0),
            started: now,
            last_heartbeat: None,
            last_full_sync: now,
            stats: NodeStats::default(),
        }
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn with_telemetry_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.relay.set_sink(sink);
        self
    }

    // ── Shared state ───────────────────────────────────────────

    /// Write a value locally and broadcast it. Returns whether it changed.
    pub fn set_state(&mut self, key: &str, value: &str) -> bool {
        let mut queue = WriteQueue::new();
        let changed = self.write_and_broadcast(key, value, &mut queue);
        self.drain_writes(queue);
        changed
    }

    /// Apply several writes in order. Returns how many changed.
    pub fn set_states<I, K, V>(&mut self, pairs: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut changed = 0;
        for (key, value) in pairs {
            if self.set_state(key.as_ref(), value.as_ref()) {
                changed += 1;
            }
        }
        changed
    }

    pub fn get_state(&self, key: &str, default: &str) -> String {
        self.store.value_or(key, default)
    }

    /// Register a watcher for `key`, or for every key with `"*"`.
    pub fn watch_state<F>(&mut self, key: impl Into<String>, watcher: F)
    where
        F: FnMut(&StateChange, &mut WriteQueue) + Send + 'static,
    {
        self.store.watch(key, Box::new(watcher));
    }

    pub fn broadcast_full_state(&mut self) {
        if self.store.is_empty() {
            return;
        }
        let snapshot = self.store.snapshot();
        debug!(entries = snapshot.len(), "broadcasting full state");
        self.send(MeshMessage::StateSync(snapshot));
    }

    pub fn request_state_sync(&mut self) {
        self.send(MeshMessage::StateRequest);
    }

    /// Merge one update as if it had arrived from the mesh.
    pub fn apply_remote_update(&mut self, update: &StateUpdate) -> MergeOutcome {
        let mut queue = WriteQueue::new();
        let outcome = self.merge(update, &mut queue);
        self.drain_writes(queue);
        outcome
    }

    fn write_and_broadcast(&mut self, key: &str, value: &str, queue: &mut WriteQueue) -> bool {
        let old_value = self.store.value_or(key, "");
        let Some(update) = self.store.write_local(key, value, self.identity.id, queue) else {
            return false;
        };

        debug!(key = %key, value = %value, version = update.version, "local state set");
        self.events.publish(Event::StateChanged {
            key: update.key.clone(),
            value: update.value.clone(),
            old_value,
            origin: update.origin,
        });
        self.send(MeshMessage::StateSet(update));

        if self.relay.enabled() {
            self.push_telemetry_at(Instant::now());
        }
        true
    }

    fn merge(&mut self, update: &StateUpdate, queue: &mut WriteQueue) -> MergeOutcome {
        let old_value = self.store.value_or(&update.key, "");
        let outcome = self.store.apply_remote(update, queue);
        match outcome {
            MergeOutcome::Accepted { changed: true } => {
                debug!(
                    key = %update.key,
                    value = %update.value,
                    version = update.version,
                    origin = update.origin,
                    "remote state applied"
                );
                self.events.publish(Event::StateChanged {
                    key: update.key.clone(),
                    value: update.value.clone(),
                    old_value,
                    origin: update.origin,
                });
            }
            MergeOutcome::Accepted { changed: false } => {}
            MergeOutcome::Rejected => {
                debug!(key = %update.key, version = update.version, "stale update rejected");
            }
        }
        outcome
    }

    fn drain_writes(&mut self, mut queue: WriteQueue) {
        let mut applied = 0;
        while let Some((key, value)) = queue.pop() {
            if applied == MAX_QUEUED_WRITES {
                warn!(
                    dropped = queue.len() + 1,
                    "too many chained state writes in one step, dropping the rest"
                );
                break;
            }
            applied += 1;
            let mut nested = WriteQueue::new();
            self.write_and_broadcast(&key, &value, &mut nested);
            queue.append(&mut nested);
        }
    }

    // ── Inbound ────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message { from, payload } => self.receive(from, &payload),
            TransportEvent::PeerConnected(id) => {
                info!(peer = %swarm_core::node_name(id), "connected");
                self.peers.record_connected(id, Instant::now());
                self.events.publish(Event::PeerConnected { node_id: id });
                self.send_heartbeat();
                self.broadcast_full_state();
            }
            TransportEvent::PeerDropped(id) => {
                self.peers.mark_dropped(id);
                self.events.publish(Event::PeerDropped { node_id: id });
                self.elect_coordinator();
            }
            TransportEvent::TopologyChanged => {
                debug!(nodes = self.transport.connected_nodes().len(), "topology changed");
                self.elect_coordinator();
            }
        }
    }

    /// Decode and dispatch one raw message from `from`.
    pub fn receive(&mut self, from: NodeId, raw: &str) {
        if from == self.identity.id {
            return;
        }
        self.stats.messages_received += 1;

        match protocol::decode(raw, from) {
            Ok(Decoded::Message(envelope)) => self.dispatch(from, envelope),
            Ok(Decoded::Unknown(tag)) => {
                self.stats.unknown_messages += 1;
                debug!(from = from, tag = tag, "ignoring unknown message type");
            }
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(from = from, error = %e, "dropping undecodable message");
            }
        }
    }

    fn dispatch(&mut self, from: NodeId, envelope: Envelope) {
        let Envelope {
            sender_name,
            message,
        } = envelope;

        match message {
            MeshMessage::Heartbeat(hb) => {
                self.peers
                    .record_heartbeat(from, &sender_name, hb.role, Instant::now());
                self.elect_coordinator();
            }
            MeshMessage::StateSet(update) => {
                self.apply_remote_update(&update);
            }
            MeshMessage::StateSync(updates) => {
                let mut queue = WriteQueue::new();
                for update in &updates {
                    self.merge(update, &mut queue);
                }
                self.drain_writes(queue);
            }
            MeshMessage::StateRequest => self.broadcast_full_state(),
            MeshMessage::Command(payload) => self.handle_command(from, &payload),
            MeshMessage::CommandResponse(payload) => {
                for handler in self.response_handlers.iter_mut() {
                    handler(from, &payload);
                }
            }
            MeshMessage::Telemetry(payload) => {
                if self.relay.is_gateway() {
                    debug!(from = %sender_name, "forwarding peer telemetry");
                    self.relay.deliver(from, payload);
                }
            }
        }
    }

    fn handle_command(&mut self, from: NodeId, payload: &Value) {
        let mut queue = WriteQueue::new();
        let mut response = None;
        for handler in self.command_handlers.iter_mut() {
            if let Some(reply) = handler(from, payload, &mut queue) {
                response = Some(reply);
                break;
            }
        }

        match response {
            Some(Value::Object(mut map)) => {
                map.insert("to".into(), json!(from));
                self.send(MeshMessage::CommandResponse(Value::Object(map)));
            }
            Some(other) => {
                self.send(MeshMessage::CommandResponse(
                    json!({ "to": from, "result": other }),
                ));
            }
            None => debug!(from = from, "command not claimed by any handler"),
        }
        self.drain_writes(queue);
    }

    // ── Membership ─────────────────────────────────────────────

    /// Re-run coordinator election against the transport's live connections.
    pub fn elect_coordinator(&mut self) -> Election {
        let result = elect(self.identity.id, &self.transport.connected_nodes());
        let previous = self.identity.role;
        self.identity.coordinator_id = result.coordinator_id;
        if previous != result.role {
            self.identity.role = result.role;
            info!(
                node = %self.identity.name,
                from = %previous,
                to = %result.role,
                coordinator = %swarm_core::node_name(result.coordinator_id),
                "role changed"
            );
            self.events.publish(Event::RoleChanged {
                from: previous,
                to: result.role,
                coordinator_id: result.coordinator_id,
            });
        }
        result
    }

    pub fn send_heartbeat(&mut self) {
        let heartbeat = Heartbeat {
            role: self.identity.role,
            uptime_secs: self.uptime().as_secs(),
            free_memory: (self.memory_probe)(),
            state_count: self.store.len() as u64,
            extra: self.heartbeat_extra.clone(),
        };
        self.send(MeshMessage::Heartbeat(heartbeat));
    }

    /// Forget peers not heard from within the peer timeout.
    pub fn prune_peers(&mut self, now: Instant) -> Vec<NodeId> {
        let removed = self.peers.prune(now, self.settings.peer_timeout);
        for &node_id in &removed {
            self.events.publish(Event::PeerPruned { node_id });
        }
        removed
    }

    // ── Timers ─────────────────────────────────────────────────

    /// Run whatever timers are due at `now`: heartbeat and pruning, periodic
    /// full sync, telemetry, then loop hooks.
    pub fn tick(&mut self, now: Instant) {
        let heartbeat_due = self.last_heartbeat.is_none_or(|last| {
            now.saturating_duration_since(last) >= self.settings.heartbeat_interval
        });
        if heartbeat_due {
            self.last_heartbeat = Some(now);
            self.send_heartbeat();
            self.prune_peers(now);
        }

        if now.saturating_duration_since(self.last_full_sync) >= self.settings.state_sync_interval {
            self.last_full_sync = now;
            self.broadcast_full_state();
        }

        if self.relay.is_due(now) {
            self.push_telemetry_at(now);
        }

        if !self.loop_hooks.is_empty() {
            let mut queue = WriteQueue::new();
            for hook in self.loop_hooks.iter_mut() {
                hook(&mut queue);
            }
            self.drain_writes(queue);
        }
    }

    // ── Telemetry ──────────────────────────────────────────────

    pub fn telemetry_report(&self) -> TelemetryReport {
        TelemetryReport {
            name: self.identity.name.clone(),
            uptime: self.uptime().as_secs(),
            heap_free: (self.memory_probe)(),
            peer_count: self.peers.alive_count(),
            role: self.identity.role,
            firmware: self.settings.firmware.clone(),
            state: self.store.values(),
        }
    }

    /// Push telemetry now. Returns false when telemetry is disabled or
    /// a gateway has nowhere to send it.
    pub fn push_telemetry(&mut self) -> bool {
        if !self.relay.enabled() {
            info!("telemetry disabled, nothing pushed");
            return false;
        }
        self.push_telemetry_at(Instant::now())
    }

    fn push_telemetry_at(&mut self, now: Instant) -> bool {
        self.relay.mark_pushed(now);
        let report = self.telemetry_report().to_value();
        if self.relay.is_gateway() {
            self.relay.deliver(self.identity.id, report)
        } else {
            self.send(MeshMessage::Telemetry(report));
            true
        }
    }

    // ── Commands & hooks ───────────────────────────────────────

    pub fn send_command(&mut self, payload: Value) {
        self.send(MeshMessage::Command(payload));
    }

    /// Add an integer field to every heartbeat. Updating an existing key
    /// keeps its position.
    pub fn set_heartbeat_data(&mut self, key: &str, value: i64) {
        if HEARTBEAT_RESERVED_KEYS.contains(&key) {
            warn!(key = %key, "heartbeat field is reserved, ignoring");
            return;
        }
        match self.heartbeat_extra.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => self.heartbeat_extra.push((key.to_string(), value)),
        }
    }

    /// Register a command handler. The first handler returning `Some` claims
    /// the command and its reply is broadcast as a command response.
    pub fn on_command<F>(&mut self, handler: F)
    where
        F: FnMut(NodeId, &Value, &mut WriteQueue) -> Option<Value> + Send + 'static,
    {
        self.command_handlers.push(Box::new(handler));
    }

    pub fn on_command_response<F>(&mut self, handler: F)
    where
        F: FnMut(NodeId, &Value) + Send + 'static,
    {
        self.response_handlers.push(Box::new(handler));
    }

    /// Register a console handler, tried before the built-in commands.
    pub fn on_console_command<F>(&mut self, handler: F)
    where
        F: FnMut(&str, &mut WriteQueue) -> Option<String> + Send + 'static,
    {
        self.console_handlers.push(Box::new(handler));
    }

    pub fn on_loop<F>(&mut self, hook: F)
    where
        F: FnMut(&mut WriteQueue) + Send + 'static,
    {
        self.loop_hooks.push(Box::new(hook));
    }

    pub(crate) fn run_console_handlers(&mut self, line: &str) -> Option<String> {
        let mut queue = WriteQueue::new();
        let mut output = None;
        for handler in self.console_handlers.iter_mut() {
            if let Some(out) = handler(line, &mut queue) {
                output = Some(out);
                break;
            }
        }
        self.drain_writes(queue);
        output
    }

    /// Source for the free-memory figure reported in heartbeats and telemetry.
    pub fn set_memory_probe<F>(&mut self, probe: F)
    where
        F: Fn() -> u64 + Send + 'static,
    {
        self.memory_probe = Box::new(probe);
    }

    pub fn shutdown(&mut self) {
        info!(node = %self.identity.name, "mesh node shutting down");
        self.transport.shutdown();
        self.events.publish(Event::Shutdown);
    }

    // ── Accessors ──────────────────────────────────────────────

    pub fn id(&self) -> NodeId {
        self.identity.id
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn role(&self) -> Role {
        self.identity.role
    }

    pub fn coordinator_id(&self) -> NodeId {
        self.identity.coordinator_id
    }

    pub fn is_coordinator(&self) -> bool {
        self.identity.role == Role::Coordinator
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Peers currently marked alive.
    pub fn peer_count(&self) -> usize {
        self.peers.alive_count()
    }

    /// Every directory entry, including dropped peers awaiting pruning.
    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn state(&self) -> &StateStore {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.identity.id,
            id_hex: format!("{:x}", self.identity.id),
            name: self.identity.name.clone(),
            role: self.identity.role,
            coordinator_id: self.identity.coordinator_id,
            peer_count: self.peers.alive_count(),
            state_count: self.store.len(),
            uptime_secs: self.uptime().as_secs(),
            free_memory: (self.memory_probe)(),
            firmware: self.settings.firmware.clone(),
            telemetry_enabled: self.relay.enabled(),
            gateway: self.relay.is_gateway(),
            stats: self.stats,
        }
    }

    pub fn peer_views(&self) -> Vec<PeerView> {
        let now = Instant::now();
        self.peers
            .iter()
            .map(|p| PeerView {
                id: p.id,
                name: p.name.clone(),
                role: p.role,
                alive: p.alive,
                last_seen_ms: now.saturating_duration_since(p.last_seen).as_millis() as u64,
            })
            .collect()
    }

    pub fn state_views(&self) -> Vec<StateView> {
        self.store
            .iter()
            .map(|(key, e)| StateView {
                key: key.clone(),
                value: e.value.clone(),
                version: e.version,
                origin: e.origin,
            })
            .collect()
    }

    fn send(&mut self, message: MeshMessage) {
        let raw = protocol::encode(&self.identity.name, &message);
        self.transport.broadcast(raw);
        self.stats.messages_sent += 1;
    }
}
