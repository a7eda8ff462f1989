//! Gateway listing and selection.

use ovgrid_state::{Gateway, keys};
use tracing::{debug, warn};

use crate::ControlPlane;
use crate::error::{ControlResult, NotFound};

/// Pick the egress gateway for `hint`.
///
/// Any NAT gateway wins outright, the first one listed. Otherwise the
/// gateway whose node ID equals the hint, or whose host name equals
/// `local_host` when the hint is empty; of several matches the last one
/// listed is taken.
pub fn select<'a>(gateways: &'a [Gateway], hint: &str, local_host: &str) -> Option<&'a Gateway> {
    if let Some(nat) = gateways.iter().find(|g| g.is_nat()) {
        return Some(nat);
    }
    gateways
        .iter()
        .rfind(|g| g.node_id == hint || (hint.is_empty() && g.host_name == local_host))
}

impl ControlPlane {
    /// Every decodable gateway record, in listing order.
    pub(crate) async fn read_gateways(&self) -> ControlResult<Vec<Gateway>> {
        let pairs = self.store.list(keys::GATEWAYS).await?;
        let mut gateways = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match serde_json::from_slice::<Gateway>(&pair.value) {
                Ok(gw) => gateways.push(gw),
                Err(e) => warn!(key = %pair.key, error = %e, "skipping undecodable gateway"),
            }
        }
        Ok(gateways)
    }

    /// NAT gateways when any exist, otherwise all gateways.
    pub async fn list_gateways(&self) -> ControlResult<Vec<Gateway>> {
        let gateways = self.read_gateways().await?;
        let nat: Vec<Gateway> = gateways.iter().filter(|g| g.is_nat()).cloned().collect();
        Ok(if nat.is_empty() { gateways } else { nat })
    }

    pub async fn get_gateway(&self, datapath_id: &str) -> ControlResult<Gateway> {
        self.store
            .get_json(&keys::gateway(datapath_id))
            .await?
            .ok_or_else(|| NotFound::Gateway.into())
    }

    /// Gateway for a node hint (an address, or empty for this host).
    pub async fn select_gateway(&self, hint: &str) -> ControlResult<Gateway> {
        let gateways = self.read_gateways().await?;
        let chosen = select(&gateways, hint, &self.hostname)
            .cloned()
            .ok_or(NotFound::Gateway)?;
        debug!(%hint, datapath_id = %chosen.datapath_id, nat = chosen.is_nat(), "gateway selected");
        Ok(chosen)
    }
}
