//! Wire format for mesh messages.
//!
//! Every message is a compact JSON envelope `{"t": <type>, "n": <sender>, "d": <payload>}`.
//! There is no message id or sequence number: duplicates and reordering are
//! absorbed by the state merge rule.

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use swarm_core::{NodeId, Role};
use thiserror::Error;

/// Name used when an envelope carries no sender name.
pub const UNKNOWN_SENDER: &str = "???";

/// Payload keys a heartbeat always carries; extras may not shadow them.
pub const HEARTBEAT_RESERVED_KEYS: [&str; 4] = ["role", "up", "heap", "states"];

/// Numeric type tag carried in the `t` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    Heartbeat = 1,
    StateSet = 2,
    StateSync = 3,
    StateRequest = 4,
    Command = 5,
    Telemetry = 6,
    CommandResponse = 7,
}

impl MsgType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(MsgType::Heartbeat),
            2 => Some(MsgType::StateSet),
            3 => Some(MsgType::StateSync),
            4 => Some(MsgType::StateRequest),
            5 => Some(MsgType::Command),
            6 => Some(MsgType::Telemetry),
            7 => Some(MsgType::CommandResponse),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Liveness announcement broadcast on every heartbeat tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub role: Role,
    pub uptime_secs: u64,
    pub free_memory: u64,
    pub state_count: u64,
    /// Extra integer fields registered by collaborators, in insertion order.
    pub extra: Vec<(String, i64)>,
}

impl Serialize for Heartbeat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4 + self.extra.len()))?;
        map.serialize_entry("role", &self.role)?;
        map.serialize_entry("up", &self.uptime_secs)?;
        map.serialize_entry("heap", &self.free_memory)?;
        map.serialize_entry("states", &self.state_count)?;
        for (key, value) in &self.extra {
            if HEARTBEAT_RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A single `(key, value, version, origin)` update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate {
    #[serde(rename = "k")]
    pub key: String,
    #[serde(rename = "v")]
    pub value: String,
    #[serde(rename = "ver")]
    pub version: u32,
    #[serde(rename = "org")]
    pub origin: NodeId,
}

impl StateUpdate {
    pub fn new(key: impl Into<String>, value: impl Into<String>, version: u32, origin: NodeId) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            version,
            origin,
        }
    }
}

/// Decoded message payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshMessage {
    Heartbeat(Heartbeat),
    StateSet(StateUpdate),
    StateSync(Vec<StateUpdate>),
    StateRequest,
    /// Free-form command, interpreted by registered command handlers.
    Command(Value),
    /// Reply produced by whichever handler claimed a command.
    CommandResponse(Value),
    /// Node metrics plus a state snapshot, kept as raw JSON so a gateway can
    /// forward it verbatim.
    Telemetry(Value),
}

impl MeshMessage {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MeshMessage::Heartbeat(_) => MsgType::Heartbeat,
            MeshMessage::StateSet(_) => MsgType::StateSet,
            MeshMessage::StateSync(_) => MsgType::StateSync,
            MeshMessage::StateRequest => MsgType::StateRequest,
            MeshMessage::Command(_) => MsgType::Command,
            MeshMessage::CommandResponse(_) => MsgType::CommandResponse,
            MeshMessage::Telemetry(_) => MsgType::Telemetry,
        }
    }
}

/// A decoded message together with the sender's self-reported name.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender_name: String,
    pub message: MeshMessage,
}

/// Result of decoding a well-formed envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Message(Envelope),
    /// Envelope parsed but its type tag is not one we know.
    Unknown(u64),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has no numeric type tag")]
    MissingType,

    #[error("payload is not an object")]
    PayloadNotObject,

    #[error("malformed {kind:?} payload: {reason}")]
    Payload { kind: MsgType, reason: String },
}

#[derive(Serialize)]
struct WireOut<'a, P: Serialize> {
    t: u8,
    n: &'a str,
    d: P,
}

#[derive(Deserialize)]
struct WireIn {
    #[serde(default)]
    t: Option<Value>,
    #[serde(default)]
    n: Option<Value>,
    #[serde(default)]
    d: Option<Value>,
}

#[derive(Serialize)]
struct SyncPayload<'a> {
    s: &'a [StateUpdate],
}

#[derive(Serialize)]
struct RequestPayload {
    req: u8,
}

/// Encode a message under the local node's name.
pub fn encode(sender_name: &str, message: &MeshMessage) -> String {
    let t = message.msg_type().tag();
    let n = sender_name;
    let encoded = match message {
        MeshMessage::Heartbeat(hb) => serde_json::to_string(&WireOut { t, n, d: hb }),
        MeshMessage::StateSet(update) => serde_json::to_string(&WireOut { t, n, d: update }),
        MeshMessage::StateSync(entries) => serde_json::to_string(&WireOut {
            t,
            n,
            d: SyncPayload { s: entries },
        }),
        MeshMessage::StateRequest => serde_json::to_string(&WireOut {
            t,
            n,
            d: RequestPayload { req: 1 },
        }),
        MeshMessage::Command(v) | MeshMessage::CommandResponse(v) | MeshMessage::Telemetry(v) => {
            serde_json::to_string(&WireOut { t, n, d: v })
        }
    };
    // Serializing plain structs and `Value` into a String cannot fail.
    encoded.unwrap_or_default()
}

/// Decode a raw payload received from node `from`.
///
/// Missing `v` defaults to `""`, missing `ver` to `0` and missing `org` to the
/// sender id. Entries without a key are dropped.
pub fn decode(raw: &str, from: NodeId) -> Result<Decoded, DecodeError> {
    let wire: WireIn = serde_json::from_str(raw)?;
    let tag = wire
        .t
        .as_ref()
        .and_then(Value::as_u64)
        .ok_or(DecodeError::MissingType)?;
    let sender_name = wire
        .n
        .as_ref()
        .and_then(Value::as_str)
        .unwrap_or(UNKNOWN_SENDER)
        .to_string();
    let Some(kind) = MsgType::from_tag(tag) else {
        return Ok(Decoded::Unknown(tag));
    };
    let payload = match wire.d {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(DecodeError::PayloadNotObject),
    };

    let message = match kind {
        MsgType::Heartbeat => MeshMessage::Heartbeat(heartbeat_from(&payload)),
        MsgType::StateSet => {
            let update = update_from(&payload, from).ok_or_else(|| DecodeError::Payload {
                kind,
                reason: "missing key".into(),
            })?;
            MeshMessage::StateSet(update)
        }
        MsgType::StateSync => {
            let entries = match payload.get("s") {
                Some(Value::Array(items)) => items,
                None | Some(Value::Null) => {
                    return Ok(Decoded::Message(Envelope {
                        sender_name,
                        message: MeshMessage::StateSync(Vec::new()),
                    }));
                }
                Some(_) => {
                    return Err(DecodeError::Payload {
                        kind,
                        reason: "`s` is not an array".into(),
                    });
                }
            };
            let updates = entries
                .iter()
                .filter_map(Value::as_object)
                .filter_map(|entry| update_from(entry, from))
                .collect();
            MeshMessage::StateSync(updates)
        }
        MsgType::StateRequest => MeshMessage::StateRequest,
        MsgType::Command => MeshMessage::Command(Value::Object(payload)),
        MsgType::CommandResponse => MeshMessage::CommandResponse(Value::Object(payload)),
        MsgType::Telemetry => MeshMessage::Telemetry(Value::Object(payload)),
    };

    Ok(Decoded::Message(Envelope {
        sender_name,
        message,
    }))
}

fn update_from(obj: &Map<String, Value>, from: NodeId) -> Option<StateUpdate> {
    let key = obj.get("k").and_then(Value::as_str).filter(|k| !k.is_empty())?;
    let value = obj.get("v").and_then(Value::as_str).unwrap_or("");
    let version = obj
        .get("ver")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);
    let origin = obj
        .get("org")
        .and_then(Value::as_u64)
        .and_then(|v| NodeId::try_from(v).ok())
        .unwrap_or(from);
    Some(StateUpdate::new(key, value, version, origin))
}

fn heartbeat_from(obj: &Map<String, Value>) -> Heartbeat {
    let number = |key: &str| obj.get(key).and_then(Value::as_u64).unwrap_or(0);
    let extra = obj
        .iter()
        .filter(|(key, _)| !HEARTBEAT_RESERVED_KEYS.contains(&key.as_str()))
        .filter_map(|(key, value)| value.as_i64().map(|v| (key.clone(), v)))
        .collect();
    Heartbeat {
        role: obj
            .get("role")
            .and_then(Value::as_str)
            .map(Role::parse_lossy)
            .unwrap_or_default(),
        uptime_secs: number("up"),
        free_memory: number("heap"),
        state_count: number("states"),
        extra,
    }
}
