use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::schema::SwarmConfig;

/// Loads the swarm configuration from disk and the environment.
pub struct ConfigLoader {
    config: SwarmConfig,
}

impl ConfigLoader {
    /// Resolve the config path: explicit path > SWARM_CONFIG env > ~/.swarm/swarm.toml
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("SWARM_CONFIG") {
            return PathBuf::from(p);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".swarm")
            .join("swarm.toml")
    }

    /// Load the config from disk, falling back to defaults.
    pub fn load(path: Option<&Path>) -> swarm_core::Result<Self> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            Self::parse_file(&config_path)?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            SwarmConfig::default()
        };

        let config = Self::apply_env_overrides(config);
        Self::check(&config)?;

        Ok(Self { config })
    }

    /// The effective configuration.
    pub fn get(&self) -> SwarmConfig {
        self.config.clone()
    }

    fn parse_file(path: &Path) -> swarm_core::Result<SwarmConfig> {
        let raw = std::fs::read_to_string(path)?;
        toml::from_str::<SwarmConfig>(&raw).map_err(|e| {
            swarm_core::SwarmError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    /// Validate config: log warnings, fail on errors.
    fn check(config: &SwarmConfig) -> swarm_core::Result<()> {
        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{}", w);
                }
                Ok(())
            }
            Err(e) => Err(swarm_core::SwarmError::Config(e)),
        }
    }

    /// Apply env var overrides (SWARM_NODE_NAME, SWARM_GATEWAY, etc.)
    fn apply_env_overrides(mut config: SwarmConfig) -> SwarmConfig {
        if let Ok(v) = std::env::var("SWARM_NODE_NAME") {
            config.node.name = Some(v);
        }
        if let Ok(v) = std::env::var("SWARM_MESH_LISTEN") {
            config.mesh.listen = v;
        }
        if let Ok(v) = std::env::var("SWARM_GATEWAY")
            && let Some(flag) = parse_flag(&v)
        {
            config.telemetry.gateway = flag;
        }
        if let Ok(v) = std::env::var("SWARM_TELEMETRY_ENABLED")
            && let Some(flag) = parse_flag(&v)
        {
            config.telemetry.enabled = flag;
        }
        if let Ok(v) = std::env::var("SWARM_TELEMETRY_URL") {
            config.telemetry.server_url = Some(v);
        }
        // Collector key: config file takes priority, env is the fallback.
        if config.telemetry.api_key.is_none()
            && let Ok(v) = std::env::var("SWARM_TELEMETRY_API_KEY")
        {
            config.telemetry.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("SWARM_SERVER_LISTEN") {
            config.server.listen = v;
        }
        if let Ok(v) = std::env::var("SWARM_LOG_LEVEL") {
            config.logging.level = v;
        }
        config
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
