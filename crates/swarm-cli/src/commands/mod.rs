use clap::{Parser, Subcommand};
use std::path::PathBuf;

use swarm_config::{ConfigLoader, SwarmConfig};
use swarm_core::SwarmError;

mod mesh;
mod start;

pub use start::StartOptions;

/// Swarm: self-organizing mesh with shared state
#[derive(Parser)]
#[command(name = "swarm", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to swarm.toml config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh and run a node until interrupted
    Start {
        /// Node name (defaults to N + last four hex digits of the id)
        #[arg(short, long)]
        name: Option<String>,
        /// Run as the telemetry gateway
        #[arg(long)]
        gateway: bool,
        /// Don't start the HTTP API server
        #[arg(long)]
        no_server: bool,
        /// Don't read console commands from stdin
        #[arg(long)]
        no_console: bool,
    },
    /// Show a running node's status
    Status,
    /// List peers known to a running node
    Peers,
    /// Show a running node's shared state
    State,
    /// Write a shared state value through a running node
    Set {
        key: String,
        value: String,
    },
    /// Read one shared state value from a running node
    Get { key: String },
    /// Show current configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show version and build info
    Version,
}

impl Cli {
    pub async fn run(self) -> swarm_core::Result<()> {
        // Load config first so we can use it for log format
        let config_loader = ConfigLoader::load(self.config.as_deref())?;
        let config = config_loader.get();

        // Resolve log level: --verbose > --quiet > --log-level > config
        let log_level = if self.verbose {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            self.log_level
                .as_deref()
                .unwrap_or(config.logging.level.as_str())
        };
        init_tracing(&config, log_level);

        match self.command {
            Commands::Start {
                name,
                gateway,
                no_server,
                no_console,
            } => {
                start::cmd_start(
                    config,
                    StartOptions {
                        name,
                        gateway,
                        no_server,
                        no_console,
                    },
                )
                .await
            }
            Commands::Status => mesh::cmd_status(&config).await,
            Commands::Peers => mesh::cmd_peers(&config).await,
            Commands::State => mesh::cmd_state(&config).await,
            Commands::Set { key, value } => mesh::cmd_set(&config, key, value).await,
            Commands::Get { key } => mesh::cmd_get(&config, key).await,
            Commands::Config { json } => Self::cmd_config(&config, json),
            Commands::Version => Self::cmd_version(),
        }
    }

    fn cmd_config(config: &SwarmConfig, json: bool) -> swarm_core::Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            println!(
                "{}",
                toml::to_string_pretty(config).map_err(|e| SwarmError::Config(e.to_string()))?
            );
        }
        Ok(())
    }

    fn cmd_version() -> swarm_core::Result<()> {
        println!("swarm {}", env!("CARGO_PKG_VERSION"));
        println!("   wire topic default: {}", SwarmConfig::default().mesh.topic);
        println!("   target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
        Ok(())
    }
}

fn init_tracing(config: &SwarmConfig, log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // try_init: a subscriber may already be installed.
    if config.logging.format == "json" {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }
}
