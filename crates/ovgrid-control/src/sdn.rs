//! SDN controller seam.
//!
//! Flow programming lives in an external OpenFlow controller. The control
//! plane only tells it about dropped containers and revoked pairs, and
//! asks it for a container's virtual address.

use async_trait::async_trait;
use ovgrid_client::{ClientError, HttpClient, TlsOptions};
use serde::{Deserialize, Serialize};

use crate::error::{ControlError, ControlResult};

/// Endpoint state the controller holds for a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SdnEndpoint {
    #[serde(rename = "MacAddress")]
    pub mac_address: String,
    #[serde(rename = "UIPAddress")]
    pub uip_address: String,
}

#[derive(Debug, Serialize)]
struct DisconnectRequest<'a> {
    sid: &'a str,
    did: &'a str,
}

#[async_trait]
pub trait SdnController: Send + Sync {
    /// Drop per-container dataplane state.
    async fn deregister_container(&self, id: &str) -> ControlResult<()>;

    /// Enforce a disconnect between two containers.
    async fn disconnect(&self, source_id: &str, dest_id: &str) -> ControlResult<()>;

    /// Endpoint state for a container, `None` if the controller has none.
    async fn container_endpoint(&self, id: &str) -> ControlResult<Option<SdnEndpoint>>;
}

fn sdn_err(e: ClientError) -> ControlError {
    ControlError::Sdn(e.to_string())
}

/// HTTP client for the OpenFlow controller.
#[derive(Clone)]
pub struct OfcClient {
    http: HttpClient,
}

impl OfcClient {
    pub fn new(url: &str, tls: Option<&TlsOptions>) -> ControlResult<Self> {
        let http = HttpClient::new(url, tls).map_err(sdn_err)?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SdnController for OfcClient {
    async fn deregister_container(&self, id: &str) -> ControlResult<()> {
        self.http
            .post_json::<()>(&format!("/v1/containers/{id}"), None)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(sdn_err)?;
        Ok(())
    }

    async fn disconnect(&self, source_id: &str, dest_id: &str) -> ControlResult<()> {
        let body = DisconnectRequest {
            sid: source_id,
            did: dest_id,
        };
        self.http
            .post_json("/v1/policy", Some(&body))
            .await
            .and_then(|r| r.error_for_status())
            .map_err(sdn_err)?;
        Ok(())
    }

    async fn container_endpoint(&self, id: &str) -> ControlResult<Option<SdnEndpoint>> {
        let resp = self
            .http
            .get(&format!("/v1/containers/{id}"))
            .await
            .map_err(sdn_err)?;
        if resp.status.as_u16() == 404 {
            return Ok(None);
        }
        let endpoint = resp
            .error_for_status()
            .and_then(|r| r.json::<SdnEndpoint>())
            .map_err(sdn_err)?;
        Ok(Some(endpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_body_field_names() {
        let body = DisconnectRequest { sid: "a", did: "b" };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"sid":"a","did":"b"}"#
        );
    }

    #[test]
    fn endpoint_tolerates_missing_fields() {
        let ep: SdnEndpoint = serde_json::from_str(r#"{"MacAddress":"02:00"}"#).unwrap();
        assert_eq!(ep.mac_address, "02:00");
        assert!(ep.uip_address.is_empty());
    }
}
