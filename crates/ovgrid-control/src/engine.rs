//! Container engine seam.
//!
//! The control plane drives a Docker-compatible engine (usually a swarm
//! manager) through [`ContainerEngine`]. [`DockerClient`] speaks the
//! engine's HTTP API; tests substitute an in-memory engine.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use ovgrid_client::{ClientError, HttpClient, Method, TlsOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ControlError, ControlResult, NotFound};

// ── Inspect ───────────────────────────────────────────────────────

/// Subset of the engine's container inspect document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerInfo {
    #[serde(rename = "Id")]
    pub id: String,
    /// Engine-reported name, usually with a leading `/`.
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Config")]
    pub config: ContainerConfig,
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
    #[serde(rename = "NetworkSettings")]
    pub network_settings: NetworkSettings,
    #[serde(rename = "State")]
    pub state: ContainerState,
    /// Present when the engine is a swarm manager.
    #[serde(rename = "Node", skip_serializing_if = "Option::is_none")]
    pub node: Option<SwarmNode>,
}

impl ContainerInfo {
    /// Name without the leading `/`.
    pub fn display_name(&self) -> &str {
        self.name.trim_start_matches('/')
    }

    /// Address of the node running the container, empty when unknown.
    pub fn node_ip(&self) -> &str {
        self.node.as_ref().map(|n| n.ip.as_str()).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "Env")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Image")]
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    #[serde(rename = "NetworkMode")]
    pub network_mode: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkSettings {
    #[serde(rename = "Networks")]
    pub networks: BTreeMap<String, EndpointNetwork>,
}

/// A container's attachment to one network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EndpointNetwork {
    #[serde(rename = "IPAddress")]
    pub ip_address: String,
    #[serde(rename = "IPPrefixLen")]
    pub ip_prefix_len: u8,
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
    #[serde(rename = "Gateway")]
    pub gateway: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerState {
    #[serde(rename = "Running")]
    pub running: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SwarmNode {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "Addr")]
    pub addr: String,
    #[serde(rename = "Name")]
    pub name: String,
}

/// Row of the container listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: Vec<String>,
}

// ── Create ────────────────────────────────────────────────────────

/// Body of a container create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateSpec {
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "Env", skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Cmd", skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "MacAddress", skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(rename = "HostConfig")]
    pub host_config: HostConfig,
    #[serde(rename = "NetworkingConfig", skip_serializing_if = "Option::is_none")]
    pub networking_config: Option<NetworkingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkingConfig {
    #[serde(rename = "EndpointsConfig")]
    pub endpoints_config: BTreeMap<String, EndpointSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSettings {
    #[serde(rename = "IPAMConfig", skip_serializing_if = "Option::is_none")]
    pub ipam_config: Option<EndpointIpamConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointIpamConfig {
    #[serde(rename = "IPv4Address")]
    pub ipv4_address: String,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(rename = "Id")]
    id: String,
}

// ── Capability ────────────────────────────────────────────────────

/// Operations the control plane needs from the container engine.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Inspect by ID, ID prefix or name.
    async fn inspect(&self, reference: &str) -> ControlResult<ContainerInfo>;

    async fn stop(&self, id: &str, grace: Duration) -> ControlResult<()>;

    async fn rename(&self, id: &str, name: &str) -> ControlResult<()>;

    /// Create a container and return its ID.
    async fn create(&self, spec: &CreateSpec, name: &str) -> ControlResult<String>;

    async fn start(&self, id: &str) -> ControlResult<()>;

    async fn remove(&self, id: &str, force: bool) -> ControlResult<()>;

    /// Every container, running or not.
    async fn list(&self) -> ControlResult<Vec<ContainerSummary>>;
}

fn engine_err(e: ClientError) -> ControlError {
    ControlError::Engine(e.to_string())
}

/// A container ID or name checked against the engine's name alphabet
/// (`[a-zA-Z0-9][a-zA-Z0-9_.-]*`), so it can sit in a URI unescaped.
fn uri_segment(reference: &str) -> ControlResult<&str> {
    let segment = reference.strip_prefix('/').unwrap_or(reference);
    let mut chars = segment.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(segment)
    } else {
        Err(ControlError::Validation(format!(
            "invalid container reference '{reference}'"
        )))
    }
}

/// HTTP client for a Docker-compatible engine.
#[derive(Clone)]
pub struct DockerClient {
    http: HttpClient,
}

impl DockerClient {
    /// `url` is `tcp://`, `http://` or `https://`; TLS options force TLS.
    pub fn new(url: &str, tls: Option<&TlsOptions>) -> ControlResult<Self> {
        let http = HttpClient::new(url, tls).map_err(engine_err)?;
        Ok(Self { http })
    }

    /// POST without a body, accepting 304 (already in the requested state).
    async fn post_action(&self, path: &str) -> ControlResult<()> {
        let resp = self
            .http
            .send(Method::POST, path, None)
            .await
            .map_err(engine_err)?;
        if resp.status.as_u16() == 304 {
            return Ok(());
        }
        resp.error_for_status().map_err(engine_err)?;
        Ok(())
    }
}

#[async_trait]
impl ContainerEngine for DockerClient {
    async fn inspect(&self, reference: &str) -> ControlResult<ContainerInfo> {
        let segment = uri_segment(reference)?;
        let resp = self
            .http
            .get(&format!("/containers/{segment}/json"))
            .await
            .map_err(engine_err)?;
        if resp.status.as_u16() == 404 {
            return Err(NotFound::Container(reference.to_string()).into());
        }
        let info = resp
            .error_for_status()
            .and_then(|r| r.json::<ContainerInfo>())
            .map_err(engine_err)?;
        debug!(%reference, id = %info.id, "container inspected");
        Ok(info)
    }

    async fn stop(&self, id: &str, grace: Duration) -> ControlResult<()> {
        let id = uri_segment(id)?;
        self.post_action(&format!("/containers/{id}/stop?t={}", grace.as_secs()))
            .await
    }

    async fn rename(&self, id: &str, name: &str) -> ControlResult<()> {
        let id = uri_segment(id)?;
        let name = uri_segment(name)?;
        self.post_action(&format!("/containers/{id}/rename?name={name}"))
            .await
    }

    async fn create(&self, spec: &CreateSpec, name: &str) -> ControlResult<String> {
        let name = uri_segment(name)?;
        let resp = self
            .http
            .post_json(&format!("/containers/create?name={name}"), Some(spec))
            .await
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<CreateResponse>())
            .map_err(engine_err)?;
        Ok(resp.id)
    }

    async fn start(&self, id: &str) -> ControlResult<()> {
        let id = uri_segment(id)?;
        self.post_action(&format!("/containers/{id}/start")).await
    }

    async fn remove(&self, id: &str, force: bool) -> ControlResult<()> {
        let id = uri_segment(id)?;
        self.http
            .delete(&format!("/containers/{id}?force={force}"))
            .await
            .and_then(|r| r.error_for_status())
            .map_err(engine_err)?;
        Ok(())
    }

    async fn list(&self) -> ControlResult<Vec<ContainerSummary>> {
        self.http
            .get("/containers/json?all=1")
            .await
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(engine_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_swarm_inspect() {
        let raw = r#"{
            "Id": "abc123",
            "Name": "/web",
            "Config": {"Tty": true, "Env": ["A=1"], "Cmd": null, "Image": "nginx"},
            "HostConfig": {"NetworkMode": "ovnet"},
            "NetworkSettings": {"Networks": {"ovnet": {
                "IPAddress": "10.1.0.5", "IPPrefixLen": 24,
                "MacAddress": "02:42:0a:01:00:05", "Gateway": "10.1.0.1"}}},
            "State": {"Running": true, "Pid": 42},
            "Node": {"ID": "n1", "IP": "192.168.1.10", "Addr": "192.168.1.10:2375", "Name": "host1"}
        }"#;
        let info: ContainerInfo = serde_json::from_str(raw).unwrap();
        assert_eq!(info.display_name(), "web");
        assert_eq!(info.node_ip(), "192.168.1.10");
        assert!(info.state.running);
        assert_eq!(info.network_settings.networks["ovnet"].ip_prefix_len, 24);
        assert!(info.config.cmd.is_none());
    }

    #[test]
    fn decode_plain_engine_inspect() {
        let info: ContainerInfo = serde_json::from_str(r#"{"Id":"x","Name":"/db"}"#).unwrap();
        assert_eq!(info.node_ip(), "");
        assert!(!info.state.running);
    }

    #[test]
    fn create_spec_wire_names() {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            "ovnet".to_string(),
            EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: "10.1.0.5".into(),
                }),
            },
        );
        let spec = CreateSpec {
            image: "nginx".into(),
            mac_address: Some("02:42:0a:01:00:05".into()),
            host_config: HostConfig {
                network_mode: "ovnet".into(),
            },
            networking_config: Some(NetworkingConfig {
                endpoints_config: endpoints,
            }),
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["MacAddress"], "02:42:0a:01:00:05");
        assert_eq!(
            json["NetworkingConfig"]["EndpointsConfig"]["ovnet"]["IPAMConfig"]["IPv4Address"],
            "10.1.0.5"
        );
        assert!(json.get("Env").is_none());
    }

    #[test]
    fn references_limited_to_name_alphabet() {
        assert_eq!(uri_segment("/web").unwrap(), "web");
        assert_eq!(uri_segment("web_1.old-2").unwrap(), "web_1.old-2");
        assert_eq!(uri_segment("4f2a9c").unwrap(), "4f2a9c");
        for bad in ["", "/", "-web", "web?force=1", "../secrets", "a b", "web&name=x", "wéb"] {
            assert!(
                matches!(uri_segment(bad), Err(ControlError::Validation(_))),
                "{bad}"
            );
        }
    }

    #[tokio::test]
    async fn bad_reference_never_reaches_the_engine() {
        // Nothing listens here; a request would fail as an engine error.
        let client = DockerClient::new("tcp://127.0.0.1:1", None).unwrap();
        let err = client.inspect("web/../../info").await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
        let err = client.rename("abc", "new name").await.unwrap_err();
        assert!(matches!(err, ControlError::Validation(_)));
    }
}
