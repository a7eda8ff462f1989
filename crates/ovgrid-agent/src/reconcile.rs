//! Converge the bridge's internal ports to the desired device set.
//!
//! Each snapshot is diffed from scratch against what OVS reports; nothing
//! is remembered between passes, so a repeated snapshot is a no-op.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ovgrid_state::Ipv4Cidr;
use tracing::{info, warn};

use crate::error::AgentResult;
use crate::host::NodeNetwork;

/// What one pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.removed.is_empty() && self.failed.is_empty()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    node: Arc<dyn NodeNetwork>,
}

impl Reconciler {
    pub fn new(node: Arc<dyn NodeNetwork>) -> Self {
        Self { node }
    }

    pub async fn reconcile(
        &self,
        desired: &BTreeMap<String, Ipv4Cidr>,
    ) -> AgentResult<ReconcileReport> {
        let bridge = self.node.bridge();
        let existing: BTreeSet<String> = self
            .node
            .internal_ports()
            .await?
            .into_iter()
            .filter(|dev| dev != bridge)
            .collect();

        let mut report = ReconcileReport::default();

        for dev in existing.iter().filter(|d| !desired.contains_key(*d)) {
            if self.tear_down(dev).await {
                report.removed.push(dev.clone());
            } else {
                report.failed.push(dev.clone());
            }
        }

        for (dev, cidr) in desired.iter().filter(|(d, _)| !existing.contains(*d)) {
            match self.bring_up(dev, cidr).await {
                Ok(()) => report.created.push(dev.clone()),
                Err(e) => {
                    warn!(%dev, %cidr, error = %e, "failed to create overlay device");
                    report.failed.push(dev.clone());
                }
            }
        }

        if !report.is_noop() {
            info!(
                created = report.created.len(),
                removed = report.removed.len(),
                failed = report.failed.len(),
                "reconciled overlay devices"
            );
        }
        Ok(report)
    }

    async fn tear_down(&self, dev: &str) -> bool {
        let addr = match self.node.address(dev).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(%dev, error = %e, "could not read device address");
                None
            }
        };
        if let Err(e) = self.node.delete_port(dev).await {
            warn!(%dev, error = %e, "failed to delete overlay device");
            return false;
        }
        match addr {
            Some(cidr) => {
                if let Err(e) = self.node.drop_rules(&cidr).await {
                    warn!(%dev, %cidr, error = %e, "failed to drop forwarding rules");
                }
            }
            None => warn!(%dev, "device had no IPv4 address, no rules to drop"),
        }
        true
    }

    async fn bring_up(&self, dev: &str, cidr: &Ipv4Cidr) -> AgentResult<()> {
        self.node.create_port(dev).await?;
        if let Err(e) = self.node.link_up(dev).await {
            warn!(%dev, error = %e, "failed to set device up");
        }
        self.node.set_address(dev, cidr).await?;
        self.node.add_rules(cidr).await
    }
}
