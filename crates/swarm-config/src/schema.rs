use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration, maps to `swarm.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub node: NodeConfig,
    pub mesh: MeshConfig,
    pub timing: TimingConfig,
    pub telemetry: TelemetryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

// ── Node ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Display name. When unset the name is derived from the node id.
    pub name: Option<String>,
    /// Firmware / software version reported in telemetry.
    pub firmware_version: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: None,
            firmware_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

// ── Mesh ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Listen multiaddr for the mesh transport.
    pub listen: String,
    /// Known peers to dial on startup.
    pub bootstrap_peers: Vec<String>,
    /// Enable mDNS for local discovery.
    pub mdns: bool,
    /// Gossip topic shared by every member of one mesh.
    pub topic: String,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            listen: "/ip4/0.0.0.0/tcp/5555".into(),
            bootstrap_peers: vec![],
            mdns: true,
            topic: "swarm/mesh/v1".into(),
        }
    }
}

// ── Timing ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Heartbeat broadcast + peer pruning interval.
    pub heartbeat_interval_ms: u64,
    /// Periodic full-state broadcast interval.
    pub state_sync_interval_ms: u64,
    /// A peer silent for longer than this is removed from the directory.
    pub peer_timeout_ms: u64,
    /// Granularity of the node's timer check.
    pub tick_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            state_sync_interval_ms: 10_000,
            peer_timeout_ms: 15_000,
            tick_ms: 100,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn state_sync_interval(&self) -> Duration {
        Duration::from_millis(self.state_sync_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ── Telemetry ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Send periodic and state-triggered telemetry.
    pub enabled: bool,
    /// This node has external connectivity and relays everyone's telemetry.
    pub gateway: bool,
    /// Base URL of the telemetry collector (gateway only).
    pub server_url: Option<String>,
    /// Sent as `X-API-Key` when set.
    pub api_key: Option<String>,
    /// Timer-driven push interval.
    pub interval_ms: u64,
    /// Bound on a single HTTP submission.
    pub timeout_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway: false,
            server_url: None,
            api_key: None,
            interval_ms: 30_000,
            timeout_ms: 5_000,
        }
    }
}

impl TelemetryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Serve the HTTP status/command API.
    pub enabled: bool,
    /// Listen address for the HTTP API.
    pub listen: String,
    /// Bearer token required on `/api/*` when set.
    pub api_key: Option<String>,
    /// Enable permissive CORS.
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:8080".into(),
            api_key: None,
            cors: false,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self.severity {
            WarningSeverity::Error => "error",
            WarningSeverity::Warning => "warning",
            WarningSeverity::Info => "info",
        };
        write!(f, "{} {}: {}", label, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl SwarmConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        // ── Intervals ───
        let intervals = [
            ("timing.heartbeat_interval_ms", self.timing.heartbeat_interval_ms),
            ("timing.state_sync_interval_ms", self.timing.state_sync_interval_ms),
            ("timing.peer_timeout_ms", self.timing.peer_timeout_ms),
            ("timing.tick_ms", self.timing.tick_ms),
            ("telemetry.interval_ms", self.telemetry.interval_ms),
            ("telemetry.timeout_ms", self.telemetry.timeout_ms),
        ];
        for (field, value) in intervals {
            if value == 0 {
                warnings.push(ConfigWarning {
                    field: field.into(),
                    message: "interval is 0".into(),
                    severity: WarningSeverity::Error,
                    hint: Some("Intervals are in milliseconds and must be positive".into()),
                });
            }
        }

        // ── Peer timeout vs heartbeat ───
        if self.timing.peer_timeout_ms > 0
            && self.timing.peer_timeout_ms <= self.timing.heartbeat_interval_ms
        {
            warnings.push(ConfigWarning {
                field: "timing.peer_timeout_ms".into(),
                message: format!(
                    "peer timeout {}ms does not exceed the heartbeat interval {}ms, live peers will be pruned",
                    self.timing.peer_timeout_ms, self.timing.heartbeat_interval_ms
                ),
                severity: WarningSeverity::Warning,
                hint: Some("Use roughly three heartbeat intervals".into()),
            });
        }

        // ── Telemetry collector ───
        match self.telemetry.server_url.as_deref() {
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                warnings.push(ConfigWarning {
                    field: "telemetry.server_url".into(),
                    message: format!("'{}' is not an http(s) URL", url),
                    severity: WarningSeverity::Error,
                    hint: Some("Set to e.g. 'http://192.168.1.100:8000'".into()),
                });
            }
            None if self.telemetry.gateway && self.telemetry.enabled => {
                warnings.push(ConfigWarning {
                    field: "telemetry.server_url".into(),
                    message: "gateway has telemetry enabled but no collector URL".into(),
                    severity: WarningSeverity::Warning,
                    hint: Some("Relayed telemetry will be dropped until a server_url is set".into()),
                });
            }
            _ => {}
        }

        // ── Node name ───
        if let Some(ref name) = self.node.name
            && name.trim().is_empty()
        {
            warnings.push(ConfigWarning {
                field: "node.name".into(),
                message: "name is blank".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Remove the key to derive the name from the node id".into()),
            });
        }

        // ── Server listen address ───
        if self.server.enabled && self.server.listen.is_empty() {
            warnings.push(ConfigWarning {
                field: "server.listen".into(),
                message: "listen address is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. '0.0.0.0:8080'".into()),
            });
        }

        // ── API key ───
        if self.server.enabled
            && self.server.api_key.is_none()
            && self.server.listen.starts_with("0.0.0.0")
        {
            warnings.push(ConfigWarning {
                field: "server.api_key".into(),
                message: "no API key set while server is network-accessible".into(),
                severity: WarningSeverity::Info,
                hint: Some("Set server.api_key to protect state writes".into()),
            });
        }

        // ── Logging format ───
        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        // ── Logging level ───
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }

        // Check for hard errors
        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
