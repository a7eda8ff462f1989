//! The node's network surface as the reconciler sees it.

use std::sync::Arc;

use async_trait::async_trait;
use ovgrid_state::Ipv4Cidr;

use crate::error::AgentResult;
use crate::exec::CommandRunner;
use crate::ip::Ip;
use crate::iptables::Iptables;
use crate::ovs::Ovs;

#[async_trait]
pub trait NodeNetwork: Send + Sync {
    /// Name of the bridge; its own internal port is never reconciled.
    fn bridge(&self) -> &str;

    async fn datapath_id(&self) -> AgentResult<String>;

    async fn internal_ports(&self) -> AgentResult<Vec<String>>;

    async fn create_port(&self, dev: &str) -> AgentResult<()>;

    async fn delete_port(&self, dev: &str) -> AgentResult<()>;

    async fn link_up(&self, dev: &str) -> AgentResult<()>;

    async fn set_address(&self, dev: &str, cidr: &Ipv4Cidr) -> AgentResult<()>;

    async fn address(&self, dev: &str) -> AgentResult<Option<Ipv4Cidr>>;

    async fn add_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()>;

    async fn drop_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()>;
}

/// OVS, `ip` and `iptables` on the local host.
#[derive(Clone)]
pub struct HostNetwork {
    ovs: Ovs,
    ip: Ip,
    iptables: Iptables,
}

impl HostNetwork {
    pub fn new(runner: Arc<dyn CommandRunner>, bridge: impl Into<String>) -> Self {
        Self {
            ovs: Ovs::new(runner.clone(), bridge),
            ip: Ip::new(runner.clone()),
            iptables: Iptables::new(runner),
        }
    }
}

#[async_trait]
impl NodeNetwork for HostNetwork {
    fn bridge(&self) -> &str {
        self.ovs.bridge()
    }

    async fn datapath_id(&self) -> AgentResult<String> {
        self.ovs.datapath_id().await
    }

    async fn internal_ports(&self) -> AgentResult<Vec<String>> {
        self.ovs.internal_ports().await
    }

    async fn create_port(&self, dev: &str) -> AgentResult<()> {
        self.ovs.create_port(dev).await
    }

    async fn delete_port(&self, dev: &str) -> AgentResult<()> {
        self.ovs.delete_port(dev).await
    }

    async fn link_up(&self, dev: &str) -> AgentResult<()> {
        self.ip.link_up(dev).await
    }

    async fn set_address(&self, dev: &str, cidr: &Ipv4Cidr) -> AgentResult<()> {
        self.ip.set_address(dev, cidr).await
    }

    async fn address(&self, dev: &str) -> AgentResult<Option<Ipv4Cidr>> {
        self.ip.address(dev).await
    }

    async fn add_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()> {
        self.iptables.add_rules(cidr).await
    }

    async fn drop_rules(&self, cidr: &Ipv4Cidr) -> AgentResult<()> {
        self.iptables.drop_rules(cidr).await
    }
}
