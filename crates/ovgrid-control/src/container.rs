//! Container network view with the SDN controller's virtual address.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ControlPlane;
use crate::error::ControlResult;

/// One network attachment of a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerNetwork {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "NetworkName")]
    pub network_name: String,
    /// `address/prefix`.
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
    #[serde(rename = "Gateway")]
    pub gateway: String,
    /// Set when the controller's endpoint matches this attachment's MAC.
    #[serde(rename = "VIPAddress", default)]
    pub vip_address: String,
}

impl ControlPlane {
    pub async fn show_container(&self, reference: &str) -> ControlResult<Vec<ContainerNetwork>> {
        let info = self.engine.inspect(reference).await?;

        let endpoint = match self.sdn.container_endpoint(&info.id).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(container = %info.id, error = %e, "sdn endpoint lookup failed");
                None
            }
        };

        Ok(info
            .network_settings
            .networks
            .iter()
            .map(|(network, ep)| {
                let vip_address = endpoint
                    .as_ref()
                    .filter(|sdn| !sdn.mac_address.is_empty() && sdn.mac_address == ep.mac_address)
                    .map(|sdn| sdn.uip_address.clone())
                    .unwrap_or_default();
                ContainerNetwork {
                    id: info.id.clone(),
                    network_name: network.clone(),
                    ip_address: format!("{}/{}", ep.ip_address, ep.ip_prefix_len),
                    mac_address: ep.mac_address.clone(),
                    gateway: ep.gateway.clone(),
                    vip_address,
                }
            })
            .collect())
    }
}
