//! Firewall allocation.
//!
//! A firewall record lives under two keys: by name and by
//! `<datapath>/<gateway port>`. Both must always hold the same record, so
//! every write touches both and a failed second write undoes the first.

use std::collections::HashMap;

use ovgrid_state::{ContainerId, Firewall, keys};
use tracing::{error, info, warn};

use crate::ControlPlane;
use crate::error::{Conflict, ControlError, ControlResult, NotFound};
use crate::migration::RemapReport;

impl ControlPlane {
    /// Allocate a firewall port for a container.
    ///
    /// `request.gateway_ip` is an optional node hint; the stored record
    /// carries the selected gateway's external address instead.
    pub async fn create_firewall(&self, request: Firewall) -> ControlResult<Firewall> {
        if request.name.is_empty() || request.container_id.is_empty() {
            return Err(ControlError::Validation(
                "name or container cannot be empty".into(),
            ));
        }

        let name_key = keys::firewall_by_name(&request.name);
        if self.store.exists(&name_key).await? {
            return Err(Conflict::FirewallName(request.name).into());
        }

        let info = self.engine.inspect(&request.container_id).await?;
        let hint = if request.gateway_ip.is_empty() {
            info.node_ip().to_string()
        } else {
            request.gateway_ip.clone()
        };
        let gateway = self.select_gateway(&hint).await?;

        let firewall = Firewall {
            container_id: info.id,
            datapath_id: gateway.datapath_id,
            gateway_ip: gateway.ext_ip,
            ..request
        };

        let node_key = firewall.node_key();
        if self.store.exists(&node_key).await? {
            return Err(Conflict::FirewallPort {
                datapath_id: firewall.datapath_id,
                port: firewall.gateway_port,
            }
            .into());
        }

        self.store.put_json(&node_key, &firewall).await?;
        if let Err(e) = self.store.put_json(&name_key, &firewall).await {
            if let Err(undo) = self.store.delete(&node_key).await {
                warn!(key = %node_key, error = %undo, "failed to undo node-index write");
            }
            return Err(e.into());
        }

        info!(
            name = %firewall.name,
            container = %firewall.container_id,
            datapath_id = %firewall.datapath_id,
            port = firewall.gateway_port,
            "firewall allocated"
        );
        Ok(firewall)
    }

    /// Delete a firewall by name and return the removed record.
    pub async fn delete_firewall(&self, name: &str) -> ControlResult<Firewall> {
        let name_key = keys::firewall_by_name(name);
        let firewall: Firewall = self
            .store
            .get_json(&name_key)
            .await?
            .ok_or_else(|| NotFound::Firewall(name.to_string()))?;

        let node_key = firewall.node_key();
        if let Err(e) = self.store.delete(&node_key).await {
            warn!(%name, key = %node_key, error = %e, "failed to delete firewall node index");
        }

        self.store.delete(&name_key).await?;

        let node_dir = firewall.node_dir();
        match self.store.list(&node_dir).await {
            Ok(remaining) if remaining.is_empty() => {
                if let Err(e) = self.store.delete_tree(&node_dir).await {
                    warn!(dir = %node_dir, error = %e, "failed to prune firewall node directory");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(dir = %node_dir, error = %e, "failed to list firewall node directory"),
        }

        info!(%name, port = firewall.gateway_port, "firewall deleted");
        Ok(firewall)
    }

    async fn read_firewalls(&self) -> ControlResult<Vec<Firewall>> {
        let pairs = self.store.list(keys::FIREWALLS_BY_NAME).await?;
        Ok(pairs
            .into_iter()
            .filter_map(|pair| match serde_json::from_slice(&pair.value) {
                Ok(fw) => Some(fw),
                Err(e) => {
                    warn!(key = %pair.key, error = %e, "skipping undecodable firewall");
                    None
                }
            })
            .collect())
    }

    /// Every firewall, with the container shown by its current name when
    /// the engine still knows it.
    pub async fn list_firewalls(&self) -> ControlResult<Vec<Firewall>> {
        let names: HashMap<String, String> = self
            .engine
            .list()
            .await?
            .into_iter()
            .filter_map(|c| {
                let name = c.names.first()?.trim_start_matches('/').to_string();
                Some((c.id, name))
            })
            .collect();

        let mut firewalls = self.read_firewalls().await?;
        for fw in &mut firewalls {
            if let Some(name) = names.get(&fw.container_id) {
                fw.container_id = name.clone();
            }
        }
        Ok(firewalls)
    }

    /// Firewalls bound to a container, given by ID or name.
    pub async fn firewalls_for_container(&self, reference: &str) -> ControlResult<Vec<Firewall>> {
        let info = self.engine.inspect(reference).await?;
        Ok(self
            .read_firewalls()
            .await?
            .into_iter()
            .filter(|fw| fw.container_id == info.id)
            .collect())
    }

    /// Firewall at a node-index position.
    pub async fn get_firewall(&self, datapath_id: &str, port: u16) -> ControlResult<Firewall> {
        self.store
            .get_json(&keys::firewall_by_node(datapath_id, port))
            .await?
            .ok_or_else(|| NotFound::Firewall(format!("{datapath_id}/{port}")).into())
    }

    /// Point every firewall bound to `old` at `new`, rewriting both
    /// indices. A record whose second write fails is put back on `old` in
    /// both indices and listed in the report as failed.
    pub(crate) async fn remap_firewalls(
        &self,
        old: &ContainerId,
        new: &ContainerId,
    ) -> ControlResult<RemapReport> {
        let mut report = RemapReport::default();
        for original in self.read_firewalls().await? {
            if original.container_id != *old {
                continue;
            }
            let remapped = Firewall {
                container_id: new.clone(),
                ..original.clone()
            };

            if let Err(e) = self.store.put_json(&remapped.node_key(), &remapped).await {
                warn!(name = %original.name, error = %e, "failed to remap firewall node index");
                report.failed.push(original.name);
                continue;
            }
            if let Err(e) = self.store.put_json(&remapped.name_key(), &remapped).await {
                warn!(name = %original.name, error = %e, "failed to remap firewall name index, restoring node index");
                if let Err(undo) = self.store.put_json(&original.node_key(), &original).await {
                    error!(
                        name = %original.name,
                        error = %undo,
                        "failed to restore firewall node index, indices disagree"
                    );
                }
                report.failed.push(original.name);
                continue;
            }
            report.moved += 1;
        }
        Ok(report)
    }
}
