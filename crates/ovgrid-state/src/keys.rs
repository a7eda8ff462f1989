//! Key layout of the shared registry.
//!
//! Keys are `/`-separated paths. Leading, trailing and doubled slashes are
//! insignificant, so every key passes through [`normalize`] before it
//! reaches a backend.

/// Gateway records keyed by datapath ID.
pub const GATEWAYS: &str = "ovgrid/gateways";

/// Group directories; members are child directory markers.
pub const GROUPS: &str = "ovgrid/groups";

/// Policy records keyed by `<idA>:<idB>`.
pub const POLICY: &str = "ovgrid/policy";

/// Firewall node index: `<datapath>/<gateway port>`.
pub const FIREWALLS_BY_NODE: &str = "ovgrid/firewalls/node";

/// Firewall name index: `<name>`.
pub const FIREWALLS_BY_NAME: &str = "ovgrid/firewalls/name";

/// Network topology declared by the container engine's network layer.
pub const NETWORKS: &str = "docker/network/v1.0/network";

/// Directories the control plane creates on startup.
pub const CONTROL_DIRS: [&str; 4] = [GROUPS, POLICY, FIREWALLS_BY_NODE, FIREWALLS_BY_NAME];

/// Canonical form of a key: no empty segments, no leading/trailing slash.
pub fn normalize(key: &str) -> String {
    key.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Join path segments into a normalized key.
pub fn join(parts: &[&str]) -> String {
    normalize(&parts.join("/"))
}

/// Last path segment of a key (`"a/b/c"` → `"c"`).
pub fn last_segment(key: &str) -> &str {
    key.trim_end_matches('/').rsplit('/').next().unwrap_or_default()
}

/// Prefix matching every strict descendant of `dir`.
pub fn descendant_prefix(dir: &str) -> String {
    let dir = normalize(dir);
    if dir.is_empty() { dir } else { format!("{dir}/") }
}

pub fn gateway(datapath_id: &str) -> String {
    join(&[GATEWAYS, datapath_id])
}

pub fn firewall_by_name(name: &str) -> String {
    join(&[FIREWALLS_BY_NAME, name])
}

pub fn firewall_node_dir(datapath_id: &str) -> String {
    join(&[FIREWALLS_BY_NODE, datapath_id])
}

pub fn firewall_by_node(datapath_id: &str, gateway_port: u16) -> String {
    join(&[FIREWALLS_BY_NODE, datapath_id, &gateway_port.to_string()])
}

pub fn policy(pair: &str) -> String {
    join(&[POLICY, pair])
}

pub fn group(name: &str) -> String {
    join(&[GROUPS, name])
}

pub fn member(group: &str, member: &str) -> String {
    join(&[GROUPS, group, member])
}
