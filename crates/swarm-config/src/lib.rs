//! # swarm-config
//!
//! Configuration system for swarm nodes. Reads from `swarm.toml` and
//! environment variables; the CLI applies its own overrides on top.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::SwarmConfig;
pub use schema::{LoggingConfig, MeshConfig, NodeConfig, ServerConfig, TelemetryConfig, TimingConfig};
pub use schema::{ConfigWarning, WarningSeverity};
