//! Container reset: replace a container with a fresh one of the same
//! name and network identity, carrying its firewall and policy records
//! over to the new ID.
//!
//! ```text
//! Original ── stop ──► Renamed (<name>old) ── create ──┬─► Replacement running
//!                                                      └─► rename back, restart
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::ControlPlane;
use crate::engine::{
    ContainerInfo, CreateSpec, EndpointIpamConfig, EndpointSettings, NetworkingConfig,
};
use crate::error::{ControlError, ControlResult};

/// Grace period given to the original before it is killed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

const RENAME_SUFFIX: &str = "old";

/// Outcome of carrying one kind of record over to a replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemapReport {
    pub moved: usize,
    /// Records left on the original container.
    pub failed: Vec<String>,
}

/// Create request for a replacement of `info`, pinned to `node_hint` when
/// one is given.
pub fn replacement_spec(info: &ContainerInfo, node_hint: Option<&str>) -> CreateSpec {
    let mut env = info.config.env.clone();
    if let Some(node) = node_hint.filter(|n| !n.is_empty()) {
        env.get_or_insert_with(Vec::new)
            .push(format!("constraint:node=={node}"));
    }

    let mode = info.host_config.network_mode.clone();
    let endpoint = info.network_settings.networks.get(&mode);

    let mac_address = endpoint
        .map(|e| e.mac_address.clone())
        .filter(|m| !m.is_empty());
    let networking_config = endpoint
        .filter(|e| !e.ip_address.is_empty())
        .map(|e| NetworkingConfig {
            endpoints_config: BTreeMap::from([(
                mode.clone(),
                EndpointSettings {
                    ipam_config: Some(EndpointIpamConfig {
                        ipv4_address: e.ip_address.clone(),
                    }),
                },
            )]),
        });

    CreateSpec {
        tty: info.config.tty,
        env,
        cmd: info.config.cmd.clone(),
        image: info.config.image.clone(),
        mac_address,
        host_config: info.host_config.clone(),
        networking_config,
    }
}

fn compensate(step: &'static str, result: ControlResult<()>) -> ControlResult<()> {
    result.map_err(|source| {
        error!(step, error = %source, "compensation failed");
        ControlError::Compensation {
            step,
            source: Box::new(source),
        }
    })
}

impl ControlPlane {
    /// Replace a container and return the replacement's ID.
    pub async fn reset_container(
        &self,
        reference: &str,
        node_hint: Option<&str>,
    ) -> ControlResult<String> {
        let original = self.engine.inspect(reference).await?;
        let old_id = original.id.clone();
        let name = original.display_name().to_string();

        if original.state.running {
            self.engine.stop(&old_id, STOP_GRACE).await?;
        }

        let parked = format!("{name}{RENAME_SUFFIX}");
        if let Err(e) = self.engine.rename(&old_id, &parked).await {
            warn!(container = %old_id, error = %e, "rename failed, restarting original");
            if original.state.running {
                compensate("restart", self.engine.start(&old_id).await)?;
            }
            return Err(e);
        }

        let spec = replacement_spec(&original, node_hint);
        let new_id = match self.engine.create(&spec, &name).await {
            Ok(id) => id,
            Err(e) => {
                warn!(container = %old_id, %name, error = %e, "replacement create failed, rolling back");
                compensate("rename-back", self.engine.rename(&old_id, &name).await)?;
                compensate("restart", self.engine.start(&old_id).await)?;
                return Err(e);
            }
        };
        info!(%name, old = %old_id, new = %new_id, "replacement created");

        let engine = self.engine.clone();
        let id = old_id.clone();
        self.tasks.spawn("remove-original", async move {
            engine.remove(&id, true).await
        });

        let sdn = self.sdn.clone();
        let id = old_id.clone();
        self.tasks.spawn("sdn-deregister", async move {
            sdn.deregister_container(&id).await
        });

        let cp = self.clone();
        let (old, new) = (old_id.clone(), new_id.clone());
        let remap = self.tasks.spawn("remap-records", async move {
            let firewalls = cp.remap_firewalls(&old, &new).await?;
            let policies = cp.remap_policies(&old, &new).await?;
            if !firewalls.failed.is_empty() || !policies.failed.is_empty() {
                warn!(
                    %old,
                    %new,
                    firewalls = ?firewalls.failed,
                    policies = ?policies.failed,
                    "some records still reference the original container"
                );
            }
            info!(
                %old,
                %new,
                firewalls = firewalls.moved,
                policies = policies.moved,
                "records remapped"
            );
            Ok(())
        });
        if let Err(e) = remap.await {
            warn!(new = %new_id, error = %e, "remap task did not complete");
        }

        self.engine.start(&new_id).await?;
        info!(%name, new = %new_id, "replacement started");
        Ok(new_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ovgrid_state::{Firewall, PolicyAction, PolicyKey, keys};

    use crate::fixtures::{Harness, gateway, harness, put_gateway};

    async fn setup() -> Harness {
        let h = harness();
        h.cp.init().await.unwrap();
        put_gateway(&h.cp, &gateway("10.0.0.1", "host-a", "dp-a", "10.0.0.1", "10.0.0.1")).await;
        h.engine.add_container("c1", "web", "10.0.0.1");
        h.engine.add_container("c2", "db", "10.0.0.1");
        h
    }

    #[test]
    fn spec_copies_identity_and_pins_node() {
        let h = harness();
        let info = h.engine.add_container("c1", "web", "");
        let spec = replacement_spec(&info, Some("node-7"));

        assert_eq!(spec.image, "busybox");
        assert_eq!(
            spec.env.as_deref(),
            Some(&["A=1".to_string(), "constraint:node==node-7".to_string()][..])
        );
        assert_eq!(spec.mac_address.as_deref(), Some("02:42:0a:01:00:05"));
        let endpoints = spec.networking_config.unwrap().endpoints_config;
        assert_eq!(
            endpoints["ovnet"].ipam_config.as_ref().unwrap().ipv4_address,
            "10.1.0.5"
        );

        let unpinned = replacement_spec(&info, None);
        assert_eq!(unpinned.env.as_deref(), Some(&["A=1".to_string()][..]));
    }

    #[tokio::test]
    async fn failed_create_leaves_original_running() {
        let h = setup().await;
        h.engine.fail_creates(3);

        for _ in 0..3 {
            let err = h.cp.reset_container("web", None).await.unwrap_err();
            assert!(matches!(err, ControlError::Engine(_)));

            let original = h.engine.container("web").unwrap();
            assert_eq!(original.id, "c1");
            assert!(original.state.running);
        }
        assert!(h.engine.container("webold").is_none());
    }

    #[tokio::test]
    async fn failed_restart_reports_compensation() {
        let h = setup().await;
        h.engine.fail_creates(1);
        h.engine.fail_starts(1);

        let err = h.cp.reset_container("web", None).await.unwrap_err();
        assert!(matches!(err, ControlError::Compensation { step: "restart", .. }));
        // Name was still restored.
        assert_eq!(h.engine.container("web").unwrap().id, "c1");
    }

    #[tokio::test]
    async fn reset_moves_records_to_new_id() {
        let h = setup().await;
        let fw = h
            .cp
            .create_firewall(Firewall {
                name: "fw1".into(),
                container_id: "web".into(),
                gateway_port: 8080,
                service_port: 80,
                ..Default::default()
            })
            .await
            .unwrap();
        h.cp.set_policy("web:db", PolicyAction::Disconnected).await.unwrap();

        let new_id = h.cp.reset_container("web", Some("node-2")).await.unwrap();
        assert_eq!(new_id, "new0001");
        h.cp.tasks().wait_idle().await;

        let replacement = h.engine.container("web").unwrap();
        assert_eq!(replacement.id, new_id);
        assert!(replacement.state.running);
        assert!(h.engine.container("c1").is_none());
        assert!(h.sdn.calls().contains(&"deregister c1".to_string()));

        let by_name: Firewall = h.cp.store().get_json(&fw.name_key()).await.unwrap().unwrap();
        let by_node: Firewall = h.cp.store().get_json(&fw.node_key()).await.unwrap().unwrap();
        assert_eq!(by_name.container_id, new_id);
        assert_eq!(by_name, by_node);

        let policies: Vec<String> = h
            .cp
            .store()
            .list(keys::POLICY)
            .await
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        let expected = PolicyKey::new("c2", &new_id).unwrap();
        assert_eq!(policies, vec![expected.to_string()]);
    }

    #[tokio::test]
    async fn stopped_original_is_not_stopped_again() {
        let h = setup().await;
        h.engine.fail_creates(1);
        h.engine.add_container("c3", "idle", "");
        h.engine.set_running("c3", false);

        h.cp.reset_container("idle", None).await.unwrap_err();
        let calls = h.engine.calls();
        assert!(!calls.contains(&"stop c3".to_string()));
        // Rollback always restarts.
        assert!(calls.contains(&"start c3".to_string()));
    }
}
