use thiserror::Error;

/// Unified error type for the swarm workspace.
///
/// Network-facing paths in the mesh never surface errors; this type covers
/// local failures only (configuration, transport start-up, a stopped runtime).
#[derive(Error, Debug)]
pub enum SwarmError {
    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Transport errors ───────────────────────────────────────
    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid address '{addr}': {reason}")]
    InvalidAddress { addr: String, reason: String },

    // ── Runtime errors ─────────────────────────────────────────
    #[error("mesh runtime is not running")]
    RuntimeStopped,

    #[error("api error: {0}")]
    Api(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SwarmError>;
