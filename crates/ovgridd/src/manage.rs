//! Manage mode: the control-plane API server.
//!
//! Opens the coordination store, connects the container engine and SDN
//! clients, and serves the REST API until Ctrl-C. Background work started
//! by requests (container removal, record remaps) is drained before exit.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use ovgrid_client::TlsOptions;
use ovgrid_control::{ControlPlane, DockerClient, OfcClient};
use ovgrid_state::{BackendOptions, BackendRegistry};
use tracing::info;

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

pub struct ManageConfig {
    pub discovery: String,
    pub discovery_opts: Vec<(String, String)>,
    pub heartbeat: Duration,
    pub listen: SocketAddr,
    pub swarm: String,
    pub ofc: String,
    pub tls: Option<TlsOptions>,
}

pub async fn run_manage(config: ManageConfig) -> anyhow::Result<()> {
    info!("ovgrid daemon starting in manage mode");

    if config.heartbeat < MIN_HEARTBEAT {
        bail!("--heartbeat should be at least one second");
    }

    // ── Coordination store ──────────────────────────────────────
    let options = BackendOptions::from_pairs(
        config
            .discovery_opts
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str())),
    )?;
    let registry = BackendRegistry::with_defaults();
    let store = registry
        .open(&config.discovery, &options, config.heartbeat, Duration::ZERO)
        .with_context(|| format!("opening discovery backend {}", config.discovery))?;

    // ── Collaborators ───────────────────────────────────────────
    let engine = DockerClient::new(&config.swarm, config.tls.as_ref())
        .with_context(|| format!("container engine at {}", config.swarm))?;
    info!(endpoint = %config.swarm, "container engine client ready");

    let sdn = OfcClient::new(&config.ofc, config.tls.as_ref())
        .with_context(|| format!("SDN controller at {}", config.ofc))?;
    info!(endpoint = %config.ofc, "SDN controller client ready");

    let cp = ControlPlane::new(store, Arc::new(engine), Arc::new(sdn), crate::hostname());
    cp.init().await?;
    info!(hostname = %cp.hostname(), "control plane initialized");

    // ── API server ──────────────────────────────────────────────
    let router = ovgrid_api::build_router(cp.clone());
    info!(addr = %config.listen, "API server starting");
    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
            }
        })
        .await?;

    // Let in-flight background work finish.
    cp.tasks().wait_idle().await;

    info!("ovgrid daemon stopped");
    Ok(())
}
