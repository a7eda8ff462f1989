//! Node agent: gateway registration and the topology watch loop.
//!
//! On start the agent reads the bridge's datapath ID, publishes this
//! node's gateway record, and keeps re-publishing it every heartbeat. In
//! parallel it watches the declared networks and reconciles the bridge
//! against every snapshot. A broken watch session is reopened after half
//! a heartbeat, which also triggers a full resync.

use std::sync::Arc;
use std::time::Duration;

use ovgrid_state::{Gateway, Store, keys};
use tokio::sync::watch;
use tokio::time::{Instant, interval_at};
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, AgentResult};
use crate::host::NodeNetwork;
use crate::reconcile::Reconciler;
use crate::topology::desired_devices;

/// TTL actually used for gateway registration. Records never expire; a
/// configured TTL is validated and then ignored.
pub const REGISTRATION_TTL: Duration = Duration::ZERO;

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Configuration for the node agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Internal interface name.
    pub iface_dev: String,
    /// Internal interface address.
    pub iface_ip: String,
    /// Node ID advertised in the gateway record. Defaults to `iface_ip`.
    pub node_addr: Option<String>,
    pub hostname: String,
    pub heartbeat: Duration,
    /// Requested record TTL, validated against the heartbeat.
    pub ttl: Duration,
}

impl AgentConfig {
    pub fn validate(&self) -> AgentResult<()> {
        if self.iface_dev.is_empty() || self.iface_ip.is_empty() {
            return Err(AgentError::Config(
                "--iface should be of the form devname:ip".into(),
            ));
        }
        if self.heartbeat < MIN_HEARTBEAT {
            return Err(AgentError::Config(
                "--heartbeat should be at least one second".into(),
            ));
        }
        if self.ttl <= self.heartbeat {
            return Err(AgentError::Config(
                "--ttl must be strictly greater than the heartbeat".into(),
            ));
        }
        Ok(())
    }

    pub fn node_id(&self) -> &str {
        self.node_addr
            .as_deref()
            .filter(|a| !a.is_empty())
            .unwrap_or(&self.iface_ip)
    }

    /// Gateway record for this node. Internal and external sides are the
    /// same interface.
    pub fn gateway(&self, datapath_id: &str) -> Gateway {
        Gateway {
            node_id: self.node_id().to_string(),
            host_name: self.hostname.clone(),
            datapath_id: datapath_id.to_string(),
            int_dev: self.iface_dev.clone(),
            int_ip: self.iface_ip.clone(),
            ext_dev: self.iface_dev.clone(),
            ext_ip: self.iface_ip.clone(),
        }
    }
}

pub struct NodeAgent {
    config: AgentConfig,
    store: Store,
    node: Arc<dyn NodeNetwork>,
    reconciler: Reconciler,
}

impl NodeAgent {
    pub fn new(config: AgentConfig, store: Store, node: Arc<dyn NodeNetwork>) -> AgentResult<Self> {
        config.validate()?;
        Ok(Self {
            reconciler: Reconciler::new(node.clone()),
            config,
            store,
            node,
        })
    }

    /// Publish this node's gateway record once.
    pub async fn register(&self) -> AgentResult<Gateway> {
        let datapath_id = self.node.datapath_id().await?;
        let gateway = self.config.gateway(&datapath_id);
        let value = serde_json::to_vec(&gateway)?;
        self.store.register(&datapath_id, &value).await?;
        info!(
            node_id = %gateway.node_id,
            %datapath_id,
            root = %self.store.root(),
            "gateway registered"
        );
        Ok(gateway)
    }

    /// Register, then reconcile until `shutdown` flips.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        let gateway = self.register().await?;
        let heartbeat = self.config.heartbeat;

        let heartbeat_handle = tokio::spawn(run_heartbeat(
            self.store.clone(),
            gateway,
            heartbeat,
            shutdown.clone(),
        ));

        self.watch_loop(shutdown).await;

        let _ = heartbeat_handle.await;
        info!("node agent stopped");
        Ok(())
    }

    async fn watch_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let backoff = self.config.heartbeat / 2;
        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.ensure_network_dir().await {
                error!(error = %e, "cannot prepare network directory");
            } else {
                self.watch_session(shutdown.clone()).await;
            }

            if *shutdown.borrow() {
                break;
            }
            warn!(backoff = ?backoff, "network watch disconnected, retrying");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn ensure_network_dir(&self) -> AgentResult<()> {
        if !self.store.exists(keys::NETWORKS).await? {
            self.store.put_tree(keys::NETWORKS).await?;
            debug!(dir = keys::NETWORKS, "network directory created");
        }
        Ok(())
    }

    async fn watch_session(&self, stop: watch::Receiver<bool>) {
        let (mut values, mut errors) = self.store.watch(keys::NETWORKS, stop).await;
        loop {
            tokio::select! {
                snapshot = values.recv() => match snapshot {
                    Some(snapshot) => self.apply(&snapshot).await,
                    None => break,
                },
                err = errors.recv() => {
                    if let Some(e) = err {
                        error!(error = %e, "network watch failed");
                    }
                    break;
                }
            }
        }
    }

    async fn apply(&self, snapshot: &[Vec<u8>]) {
        let desired = desired_devices(snapshot);
        debug!(records = snapshot.len(), devices = desired.len(), "network snapshot");
        if let Err(e) = self.reconciler.reconcile(&desired).await {
            error!(error = %e, "reconcile failed");
        }
    }
}

async fn run_heartbeat(
    store: Store,
    gateway: Gateway,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let value = match serde_json::to_vec(&gateway) {
        Ok(v) => v,
        Err(e) => {
            error!(error = %e, "cannot encode gateway record");
            return;
        }
    };
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.register(&gateway.datapath_id, &value).await {
                    Ok(()) => debug!(datapath_id = %gateway.datapath_id, "gateway re-registered"),
                    Err(e) => warn!(datapath_id = %gateway.datapath_id, error = %e, "gateway re-registration failed"),
                }
            }
            _ = shutdown.changed() => {
                debug!("heartbeat loop shutting down");
                break;
            }
        }
    }
}
