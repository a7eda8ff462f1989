//! Agent mode: runs on every node that carries overlay ports.
//!
//! In this mode, the daemon:
//! 1. Opens the coordination store with a zero registration TTL
//! 2. Reads the bridge's datapath ID and registers the node's gateway
//! 3. Re-registers every heartbeat
//! 4. Watches the declared networks and reconciles the bridge on each change

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ovgrid_agent::{AgentConfig, HostNetwork, NodeAgent, REGISTRATION_TTL, SystemRunner};
use ovgrid_state::{BackendOptions, BackendRegistry};
use tokio::sync::watch;
use tracing::{info, warn};

pub struct AgentArgs {
    pub discovery: String,
    pub discovery_opts: Vec<(String, String)>,
    pub heartbeat: Duration,
    pub iface: (String, String),
    pub addr: Option<String>,
    pub bridge: String,
    pub ttl: Duration,
}

pub async fn run_agent(args: AgentArgs) -> anyhow::Result<()> {
    info!("ovgrid daemon starting in agent mode");

    let (iface_dev, iface_ip) = args.iface;
    let config = AgentConfig {
        iface_dev,
        iface_ip,
        node_addr: args.addr,
        hostname: crate::hostname(),
        heartbeat: args.heartbeat,
        ttl: args.ttl,
    };
    config.validate()?;
    warn!(
        requested = ?args.ttl,
        "registration TTL forced to zero; gateway records do not expire"
    );

    // ── Coordination store ──────────────────────────────────────
    let options = BackendOptions::from_pairs(
        args.discovery_opts
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    )?;
    let store = BackendRegistry::with_defaults()
        .open(&args.discovery, &options, args.heartbeat, REGISTRATION_TTL)
        .with_context(|| format!("opening discovery backend {}", args.discovery))?;

    // ── Host network ────────────────────────────────────────────
    let node = Arc::new(HostNetwork::new(Arc::new(SystemRunner), &args.bridge));
    info!(bridge = %args.bridge, "host network ready");

    let agent = NodeAgent::new(config, store, node)?;

    // ── Shutdown signal ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
        }
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await?;

    info!("ovgrid daemon stopped");
    Ok(())
}
