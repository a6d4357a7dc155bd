use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::System;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use swarm_config::SwarmConfig;
use swarm_core::EventBus;
use swarm_mesh::transport::p2p::{self, P2pOptions};
use swarm_mesh::{HttpTelemetrySink, MeshNode, NodeHandle, NodeSettings, runtime};

/// Flags of `swarm start` that override the config file.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub name: Option<String>,
    pub gateway: bool,
    pub no_server: bool,
    pub no_console: bool,
}

/// Fold command-line flags into the loaded config.
pub(super) fn apply_options(mut config: SwarmConfig, opts: &StartOptions) -> SwarmConfig {
    if let Some(name) = &opts.name {
        config.node.name = Some(name.clone());
    }
    if opts.gateway {
        config.telemetry.gateway = true;
    }
    if opts.no_server {
        config.server.enabled = false;
    }
    config
}

pub(super) async fn cmd_start(config: SwarmConfig, opts: StartOptions) -> swarm_core::Result<()> {
    let config = apply_options(config, &opts);

    let (transport, transport_events) = p2p::start(P2pOptions::from(&config.mesh)).await?;
    let events = EventBus::default();
    let mut node = MeshNode::new(Box::new(transport), NodeSettings::from_config(&config))
        .with_event_bus(events.clone());
    node.set_memory_probe(host_available_memory());

    println!("swarm v{}", env!("CARGO_PKG_VERSION"));
    println!("   Node:      {} ({:08x})", node.name(), node.id());
    println!("   Listen:    {}", config.mesh.listen);
    println!(
        "   Telemetry: {}",
        match (config.telemetry.enabled, config.telemetry.gateway) {
            (_, true) => "gateway",
            (true, false) => "relay via mesh",
            (false, false) => "off",
        }
    );

    if config.telemetry.gateway {
        match &config.telemetry.server_url {
            Some(url) => {
                let sink = HttpTelemetrySink::new(
                    url.clone(),
                    config.telemetry.api_key.clone(),
                    config.telemetry.timeout(),
                )?
                .with_event_bus(events.clone());
                node = node.with_telemetry_sink(Arc::new(sink));
                println!("   Server:    {url}");
            }
            None => warn!("gateway mode without telemetry.server_url, reports cannot be pushed"),
        }
    }
    println!();

    let (handle, mut task) = runtime::spawn(node, transport_events, config.timing.tick());

    if config.server.enabled {
        let server_config = config.server.clone();
        let server_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = swarm_server::start_server(server_config, server_handle).await {
                error!(error = %e, "API server failed");
            }
        });
    }

    if !opts.no_console {
        tokio::spawn(run_console(handle.clone()));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, leaving the mesh");
            handle.shutdown().await;
            let _ = task.await;
        }
        res = &mut task => {
            if let Err(e) = res {
                error!(error = %e, "mesh runtime task failed");
            }
        }
    }

    Ok(())
}

/// Available system memory in bytes, refreshed on every read.
fn host_available_memory() -> impl Fn() -> u64 + Send + 'static {
    let system = Mutex::new(System::new());
    move || {
        let mut sys = system.lock();
        sys.refresh_memory();
        sys.available_memory()
    }
}

/// Feed stdin lines to the node console until EOF or the node stops.
async fn run_console(handle: NodeHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match handle.console(line).await {
            Ok(out) if out.is_empty() => {}
            Ok(out) => println!("{out}"),
            Err(_) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let mut config = SwarmConfig::default();
        config.server.enabled = true;
        let opts = StartOptions {
            name: Some("Gate".into()),
            gateway: true,
            no_server: true,
            no_console: false,
        };
        let config = apply_options(config, &opts);
        assert_eq!(config.node.name.as_deref(), Some("Gate"));
        assert!(config.telemetry.gateway);
        assert!(!config.server.enabled);
    }

    #[test]
    fn test_host_memory_is_reported() {
        let read = host_available_memory();
        assert!(read() > 0);
        assert!(read() > 0);
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = SwarmConfig::default();
        config.telemetry.gateway = true;
        let config = apply_options(config, &StartOptions::default());
        assert!(config.telemetry.gateway);
        assert!(config.node.name.is_none());
    }
}
