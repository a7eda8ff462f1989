//! Registry records.
//!
//! Gateway, firewall and policy records are written by ovgrid and read by
//! the external SDN controller, so their JSON field names are part of the
//! wire contract. Network records are written by the container engine's
//! network layer and only decoded here.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::keys;

/// Container identifier as reported by the container engine.
pub type ContainerId = String;

/// OVS bridge datapath identifier.
pub type DatapathId = String;

// ── Gateway ───────────────────────────────────────────────────────

/// Per-node egress descriptor, one per OVS bridge datapath.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gateway {
    #[serde(rename = "Node")]
    pub node_id: String,
    #[serde(rename = "HostName")]
    pub host_name: String,
    #[serde(rename = "DatapathID")]
    pub datapath_id: DatapathId,
    #[serde(rename = "IntDev")]
    pub int_dev: String,
    #[serde(rename = "IntIP")]
    pub int_ip: String,
    #[serde(rename = "ExtDev")]
    pub ext_dev: String,
    #[serde(rename = "ExtIP")]
    pub ext_ip: String,
}

impl Gateway {
    /// A gateway whose external side differs from its internal side.
    pub fn is_nat(&self) -> bool {
        self.int_dev != self.ext_dev || self.int_ip != self.ext_ip
    }

    pub fn table_key(&self) -> String {
        keys::gateway(&self.datapath_id)
    }
}

// ── Firewall ──────────────────────────────────────────────────────

/// Named binding from a container to a gateway port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Firewall {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Container")]
    pub container_id: ContainerId,
    #[serde(rename = "DatapathID", default)]
    pub datapath_id: DatapathId,
    #[serde(rename = "GatewayIP", default)]
    pub gateway_ip: String,
    #[serde(rename = "GatewayPort", default)]
    pub gateway_port: u16,
    #[serde(rename = "ServicePort", default)]
    pub service_port: u16,
}

impl Firewall {
    /// Key in the name index.
    pub fn name_key(&self) -> String {
        keys::firewall_by_name(&self.name)
    }

    /// Key in the node index.
    pub fn node_key(&self) -> String {
        keys::firewall_by_node(&self.datapath_id, self.gateway_port)
    }

    /// Directory holding every port allocated on this firewall's datapath.
    pub fn node_dir(&self) -> String {
        keys::firewall_node_dir(&self.datapath_id)
    }
}

// ── Policy ────────────────────────────────────────────────────────

/// Connectivity decision for a container pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyAction {
    #[serde(rename = "ACCEPT")]
    Connected,
    #[serde(rename = "DROP")]
    Disconnected,
}

impl PolicyAction {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Connected => "ACCEPT",
            PolicyAction::Disconnected => "DROP",
        }
    }

    /// Decode a stored value; anything unrecognised is `None`.
    pub fn from_bytes(value: &[u8]) -> Option<Self> {
        match value {
            b"ACCEPT" => Some(PolicyAction::Connected),
            b"DROP" => Some(PolicyAction::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyAction {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyAction::from_bytes(s.as_bytes())
            .ok_or_else(|| StoreError::Deserialize(format!("unknown policy action: {s}")))
    }
}

/// Unordered container pair in canonical (ascending) order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    first: ContainerId,
    second: ContainerId,
}

impl PolicyKey {
    /// Canonicalize a pair. Returns `None` when both sides are the same.
    pub fn new(a: &str, b: &str) -> Option<Self> {
        match a.cmp(b) {
            std::cmp::Ordering::Less => Some(Self {
                first: a.to_string(),
                second: b.to_string(),
            }),
            std::cmp::Ordering::Greater => Some(Self {
                first: b.to_string(),
                second: a.to_string(),
            }),
            std::cmp::Ordering::Equal => None,
        }
    }

    /// Parse the last segment of a stored policy key (`<a>:<b>`).
    pub fn parse(segment: &str) -> Option<Self> {
        let (a, b) = segment.split_once(':')?;
        if a.is_empty() || b.is_empty() || b.contains(':') {
            return None;
        }
        Self::new(a, b)
    }

    pub fn first(&self) -> &str {
        &self.first
    }

    pub fn second(&self) -> &str {
        &self.second
    }

    pub fn contains(&self, id: &str) -> bool {
        self.first == id || self.second == id
    }

    /// Substitute `old` with `new` and re-canonicalize.
    pub fn replace(&self, old: &str, new: &str) -> Option<Self> {
        let swap = |side: &str| if side == old { new.to_string() } else { side.to_string() };
        Self::new(&swap(&self.first), &swap(&self.second))
    }

    /// Full registry key.
    pub fn table_key(&self) -> String {
        keys::policy(&self.to_string())
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.first, self.second)
    }
}

// ── Network topology ──────────────────────────────────────────────

/// IPv4 address with prefix length, e.g. `10.1.0.1/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl FromStr for Ipv4Cidr {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || StoreError::Deserialize(format!("invalid IPv4 CIDR: {s}"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(bad)?;
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| bad())?;
        let prefix = prefix.parse::<u8>().map_err(|_| bad())?;
        if prefix > 32 {
            return Err(bad());
        }
        Ok(Self { addr, prefix })
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// One IPv4 address pool of a declared network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpamInfo {
    pub pool_id: String,
    pub address_space: String,
    pub pool: Option<Ipv4Cidr>,
    pub gateway: Option<Ipv4Cidr>,
}

/// A network declared by the container engine's network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    pub id: String,
    pub network_type: String,
    pub ipv4: Vec<IpamInfo>,
}

#[derive(Deserialize)]
struct RawNetwork {
    id: String,
    #[serde(rename = "networkType")]
    network_type: String,
    #[serde(rename = "ipamV4Info", default)]
    ipam_v4_info: Option<String>,
}

#[derive(Deserialize)]
struct RawIpamInfo {
    #[serde(rename = "PoolID", default)]
    pool_id: String,
    #[serde(rename = "IPAMData", default)]
    ipam_data: Option<String>,
}

#[derive(Deserialize)]
struct RawIpamData {
    #[serde(rename = "AddressSpace", default)]
    address_space: String,
    #[serde(rename = "Pool", default)]
    pool: Option<String>,
    #[serde(rename = "Gateway", default)]
    gateway: Option<String>,
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialize(e.to_string()))
}

fn parse_cidr(value: Option<String>) -> StoreResult<Option<Ipv4Cidr>> {
    value
        .filter(|v| !v.is_empty())
        .map(|v| v.parse())
        .transpose()
}

impl NetworkRecord {
    /// Decode a network record. The IPAM info list and each IPAM data
    /// entry are JSON documents embedded as strings.
    pub fn decode(bytes: &[u8]) -> StoreResult<Self> {
        let raw: RawNetwork = decode(bytes)?;

        let mut ipv4 = Vec::new();
        if let Some(info) = raw.ipam_v4_info.filter(|s| !s.is_empty()) {
            let infos: Vec<RawIpamInfo> = decode(info.as_bytes())?;
            for info in infos {
                let data: Option<RawIpamData> = info
                    .ipam_data
                    .filter(|s| !s.is_empty())
                    .map(|s| decode(s.as_bytes()))
                    .transpose()?;
                let (address_space, pool, gateway) = match data {
                    Some(d) => (d.address_space, parse_cidr(d.pool)?, parse_cidr(d.gateway)?),
                    None => (String::new(), None, None),
                };
                ipv4.push(IpamInfo {
                    pool_id: info.pool_id,
                    address_space,
                    pool,
                    gateway,
                });
            }
        }

        Ok(Self {
            id: raw.id,
            network_type: raw.network_type,
            ipv4,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway() -> Gateway {
        Gateway {
            node_id: "10.0.0.1".into(),
            host_name: "node-1".into(),
            datapath_id: "0000aabbccddeeff".into(),
            int_dev: "eth0".into(),
            int_ip: "10.0.0.1".into(),
            ext_dev: "eth0".into(),
            ext_ip: "10.0.0.1".into(),
        }
    }

    #[test]
    fn gateway_wire_names() {
        let json = serde_json::to_value(test_gateway()).unwrap();
        assert_eq!(json["Node"], "10.0.0.1");
        assert_eq!(json["DatapathID"], "0000aabbccddeeff");
        assert_eq!(json["IntIP"], "10.0.0.1");
        assert_eq!(json["ExtDev"], "eth0");
    }

    #[test]
    fn gateway_nat_detection() {
        let mut gw = test_gateway();
        assert!(!gw.is_nat());

        gw.ext_ip = "20.0.0.1".into();
        assert!(gw.is_nat());

        let mut gw = test_gateway();
        gw.ext_dev = "eth1".into();
        assert!(gw.is_nat());
    }

    #[test]
    fn firewall_decodes_with_defaults() {
        let fw: Firewall =
            serde_json::from_str(r#"{"Name":"web","Container":"c1","GatewayPort":8080}"#).unwrap();
        assert_eq!(fw.name, "web");
        assert_eq!(fw.container_id, "c1");
        assert_eq!(fw.gateway_port, 8080);
        assert_eq!(fw.service_port, 0);
        assert!(fw.datapath_id.is_empty());
    }

    #[test]
    fn policy_action_wire_values() {
        assert_eq!(PolicyAction::from_bytes(b"ACCEPT"), Some(PolicyAction::Connected));
        assert_eq!(PolicyAction::from_bytes(b"DROP"), Some(PolicyAction::Disconnected));
        assert_eq!(PolicyAction::from_bytes(b"accept"), None);
        assert_eq!(
            serde_json::to_string(&PolicyAction::Disconnected).unwrap(),
            "\"DROP\""
        );
        assert!("MAYBE".parse::<PolicyAction>().is_err());
    }

    #[test]
    fn policy_key_is_order_independent() {
        let ab = PolicyKey::new("aaa", "bbb").unwrap();
        let ba = PolicyKey::new("bbb", "aaa").unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), "aaa:bbb");
        assert_eq!(ab.table_key(), "ovgrid/policy/aaa:bbb");
    }

    #[test]
    fn policy_key_rejects_self_pair() {
        assert!(PolicyKey::new("same", "same").is_none());
        assert!(PolicyKey::parse("same:same").is_none());
    }

    #[test]
    fn policy_key_parse_requires_two_parts() {
        assert!(PolicyKey::parse("onlyone").is_none());
        assert!(PolicyKey::parse("a:b:c").is_none());
        assert!(PolicyKey::parse(":b").is_none());
        assert_eq!(PolicyKey::parse("b:a").unwrap().to_string(), "a:b");
    }

    #[test]
    fn policy_key_replace_recanonicalizes() {
        let key = PolicyKey::new("bbb", "ccc").unwrap();
        let moved = key.replace("ccc", "aaa").unwrap();
        assert_eq!(moved.to_string(), "aaa:bbb");
        assert!(key.replace("ccc", "bbb").is_none());
    }

    #[test]
    fn cidr_parse_and_display() {
        let cidr: Ipv4Cidr = "10.1.0.1/24".parse().unwrap();
        assert_eq!(cidr.addr, Ipv4Addr::new(10, 1, 0, 1));
        assert_eq!(cidr.prefix, 24);
        assert_eq!(cidr.to_string(), "10.1.0.1/24");

        assert!("10.1.0.1".parse::<Ipv4Cidr>().is_err());
        assert!("10.1.0.1/33".parse::<Ipv4Cidr>().is_err());
        assert!("fe80::1/64".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn network_record_decodes_nested_ipam() {
        let ipam_data = r#"{"AddressSpace":"LocalDefault","Gateway":"10.1.0.1/24","Pool":"10.1.0.0/24"}"#;
        let ipam_info = serde_json::to_string(&serde_json::json!([
            {"PoolID": "pool-1", "Meta": null, "IPAMData": ipam_data}
        ]))
        .unwrap();
        let raw = serde_json::json!({
            "id": "4c1e0a9d8f7b6a5e4d3c2b1a",
            "networkType": "ovgrid",
            "name": "blue",
            "ipamV4Info": ipam_info,
        });

        let net = NetworkRecord::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(net.id, "4c1e0a9d8f7b6a5e4d3c2b1a");
        assert_eq!(net.network_type, "ovgrid");
        assert_eq!(net.ipv4.len(), 1);
        assert_eq!(net.ipv4[0].pool_id, "pool-1");
        assert_eq!(net.ipv4[0].gateway.unwrap().to_string(), "10.1.0.1/24");
        assert_eq!(net.ipv4[0].pool.unwrap().to_string(), "10.1.0.0/24");
    }

    #[test]
    fn network_record_without_ipam() {
        let net = NetworkRecord::decode(br#"{"id":"n1","networkType":"bridge"}"#).unwrap();
        assert!(net.ipv4.is_empty());
    }

    #[test]
    fn network_record_rejects_garbage() {
        assert!(NetworkRecord::decode(b"not json").is_err());
        assert!(NetworkRecord::decode(br#"{"networkType":"ovgrid"}"#).is_err());
        assert!(
            NetworkRecord::decode(br#"{"id":"n1","networkType":"ovgrid","ipamV4Info":"[oops"}"#)
                .is_err()
        );
    }
}
