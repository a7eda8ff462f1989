//! Desired local devices derived from the declared network records.

use std::collections::BTreeMap;

use ovgrid_state::{Ipv4Cidr, NetworkRecord};
use tracing::{debug, warn};

/// Network driver type handled by ovgrid.
pub const NETWORK_TYPE: &str = "ovgrid";

const DEVICE_PREFIX: &str = "tap";
const DEVICE_ID_CHARS: usize = 11;

/// Internal port name for a network: `tap` plus the first 11 characters
/// of its ID.
pub fn device_name(network_id: &str) -> String {
    let end = network_id
        .char_indices()
        .nth(DEVICE_ID_CHARS)
        .map_or(network_id.len(), |(i, _)| i);
    format!("{DEVICE_PREFIX}{}", &network_id[..end])
}

/// Device name → gateway address for every ovgrid network in `snapshot`.
pub fn desired_devices(snapshot: &[Vec<u8>]) -> BTreeMap<String, Ipv4Cidr> {
    let mut devices = BTreeMap::new();
    for value in snapshot {
        let network = match NetworkRecord::decode(value) {
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "skipping undecodable network record");
                continue;
            }
        };
        if network.network_type != NETWORK_TYPE {
            continue;
        }
        let [ipam] = network.ipv4.as_slice() else {
            warn!(
                network = %network.id,
                subnets = network.ipv4.len(),
                "only one IPv4 subnet per network is supported, skipping"
            );
            continue;
        };
        let Some(gateway) = ipam.gateway else {
            warn!(network = %network.id, "network has no gateway address, skipping");
            continue;
        };
        devices.insert(device_name(&network.id), gateway);
    }
    devices
}
