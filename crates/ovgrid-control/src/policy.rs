//! Pairwise connectivity policy.
//!
//! One record per unordered container pair, keyed by the two canonical
//! IDs in ascending order, so `A:B` and `B:A` address the same record.

use std::collections::BTreeMap;

use ovgrid_state::{ContainerId, PolicyAction, PolicyKey, keys};
use tracing::{debug, error, info, warn};

use crate::ControlPlane;
use crate::error::{Conflict, ControlError, ControlResult, NotFound};
use crate::migration::RemapReport;

fn split_reference(reference: &str) -> ControlResult<(&str, &str)> {
    let mut parts = reference.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(a), Some(b), None) if !a.is_empty() && !b.is_empty() => Ok((a, b)),
        _ => Err(ControlError::Validation(
            "policy format should be <CONTAINER:CONTAINER>".into(),
        )),
    }
}

impl ControlPlane {
    /// Resolve `A:B` (IDs or names) to its canonical key.
    pub async fn resolve_pair(&self, reference: &str) -> ControlResult<PolicyKey> {
        let (a, b) = split_reference(reference)?;
        let a = self.engine.inspect(a).await?.id;
        let b = self.engine.inspect(b).await?.id;
        PolicyKey::new(&a, &b).ok_or_else(|| Conflict::PolicySelfPair(a).into())
    }

    pub async fn set_policy(&self, reference: &str, action: PolicyAction) -> ControlResult<PolicyKey> {
        let key = self.resolve_pair(reference).await?;

        if action == PolicyAction::Disconnected {
            if let Err(e) = self.sdn.disconnect(key.first(), key.second()).await {
                warn!(pair = %key, error = %e, "sdn disconnect notification failed");
            }
        }

        self.store
            .put(&key.table_key(), action.as_str().as_bytes())
            .await?;
        info!(pair = %key, %action, "policy set");
        Ok(key)
    }

    /// Stored action, `None` when absent or unrecognised.
    pub async fn get_policy(&self, reference: &str) -> ControlResult<Option<PolicyAction>> {
        let key = self.resolve_pair(reference).await?;
        Ok(self
            .store
            .get(&key.table_key())
            .await?
            .and_then(|pair| PolicyAction::from_bytes(&pair.value)))
    }

    pub async fn delete_policy(&self, reference: &str) -> ControlResult<()> {
        let key = self.resolve_pair(reference).await?;
        if !self.store.delete(&key.table_key()).await? {
            return Err(NotFound::Policy(key.to_string()).into());
        }
        info!(pair = %key, "policy deleted");
        Ok(())
    }

    async fn container_name(&self, id: &str) -> Option<String> {
        match self.engine.inspect(id).await {
            Ok(info) => Some(info.display_name().to_string()),
            Err(e) => {
                debug!(container = %id, error = %e, "policy container no longer resolves");
                None
            }
        }
    }

    /// Every policy, keyed `"<nameA>:<nameB>"`.
    pub async fn list_policies(&self) -> ControlResult<BTreeMap<String, PolicyAction>> {
        let mut out = BTreeMap::new();
        for pair in self.store.list(keys::POLICY).await? {
            let Some(key) = PolicyKey::parse(pair.name()) else {
                warn!(key = %pair.key, "skipping malformed policy key");
                continue;
            };
            let Some(action) = PolicyAction::from_bytes(&pair.value) else {
                warn!(key = %pair.key, "skipping unrecognised policy action");
                continue;
            };
            let (Some(a), Some(b)) = (
                self.container_name(key.first()).await,
                self.container_name(key.second()).await,
            ) else {
                continue;
            };
            out.insert(format!("{a}:{b}"), action);
        }
        Ok(out)
    }

    /// Move every policy naming `old` onto `new`, re-canonicalizing the key.
    /// When the stale record cannot be deleted the new key is put back the
    /// way it was, so a pair is never held under both IDs.
    pub(crate) async fn remap_policies(
        &self,
        old: &ContainerId,
        new: &ContainerId,
    ) -> ControlResult<RemapReport> {
        let mut report = RemapReport::default();
        for pair in self.store.list(keys::POLICY).await? {
            let Some(key) = PolicyKey::parse(pair.name()) else {
                continue;
            };
            if !key.contains(old) {
                continue;
            }

            let Some(next) = key.replace(old, new) else {
                warn!(pair = %key, "remap would pair a container with itself, dropping");
                if let Err(e) = self.store.delete(&key.table_key()).await {
                    warn!(pair = %key, error = %e, "failed to delete stale policy");
                    report.failed.push(key.to_string());
                }
                continue;
            };

            let prior = match self.store.get(&next.table_key()).await {
                Ok(prior) => prior,
                Err(e) => {
                    warn!(pair = %next, error = %e, "failed to read remap target");
                    report.failed.push(key.to_string());
                    continue;
                }
            };
            if let Err(e) = self.store.put(&next.table_key(), &pair.value).await {
                warn!(pair = %key, error = %e, "failed to write remapped policy");
                report.failed.push(key.to_string());
                continue;
            }
            if let Err(e) = self.store.delete(&key.table_key()).await {
                warn!(pair = %key, error = %e, "failed to delete stale policy, undoing remap");
                let undo = match prior {
                    Some(prior) => self.store.put(&next.table_key(), &prior.value).await,
                    None => self.store.delete(&next.table_key()).await.map(drop),
                };
                if let Err(undo) = undo {
                    error!(pair = %next, error = %undo, "failed to undo remapped policy");
                }
                report.failed.push(key.to_string());
                continue;
            }
            report.moved += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Harness, faulty_harness, harness};

    fn setup() -> Harness {
        let h = harness();
        h.engine.add_container("aaa", "web", "");
        h.engine.add_container("bbb", "db", "");
        h.engine.add_container("ccc", "cache", "");
        h
    }

    #[tokio::test]
    async fn both_orders_address_one_record() {
        let h = setup();
        let k1 = h.cp.set_policy("bbb:aaa", PolicyAction::Connected).await.unwrap();
        let k2 = h.cp.resolve_pair("web:db").await.unwrap();
        assert_eq!(k1, k2);
        assert_eq!(k1.to_string(), "aaa:bbb");

        assert_eq!(
            h.cp.get_policy("aaa:bbb").await.unwrap(),
            Some(PolicyAction::Connected)
        );
        assert_eq!(
            h.cp.get_policy("db:web").await.unwrap(),
            Some(PolicyAction::Connected)
        );
        assert_eq!(h.cp.store().list(keys::POLICY).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn self_pair_is_rejected() {
        let h = setup();
        let err = h.cp.set_policy("web:aaa", PolicyAction::Connected).await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(Conflict::PolicySelfPair(_))));
    }

    #[tokio::test]
    async fn malformed_reference_is_validation() {
        let h = setup();
        for bad in ["web", "web:", ":db", "a:b:c"] {
            let err = h.cp.resolve_pair(bad).await.unwrap_err();
            assert!(matches!(err, ControlError::Validation(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn disconnect_notifies_sdn_best_effort() {
        let h = setup();
        h.sdn.set_unreachable(true);
        h.cp.set_policy("web:db", PolicyAction::Disconnected).await.unwrap();
        assert_eq!(h.sdn.calls(), vec!["disconnect aaa bbb"]);

        let stored = h.cp.store().get("ovgrid/policy/aaa:bbb").await.unwrap().unwrap();
        assert_eq!(stored.value, b"DROP");

        h.cp.set_policy("web:db", PolicyAction::Connected).await.unwrap();
        assert_eq!(h.sdn.calls().len(), 1);
    }

    #[tokio::test]
    async fn listing_uses_names_and_skips_stale() {
        let h = setup();
        h.cp.set_policy("web:db", PolicyAction::Connected).await.unwrap();
        h.cp.set_policy("cache:web", PolicyAction::Disconnected).await.unwrap();
        h.cp.store().put("ovgrid/policy/aaa:gone", b"ACCEPT").await.unwrap();

        let listed = h.cp.list_policies().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed.get("web:db"), Some(&PolicyAction::Connected));
        assert_eq!(listed.get("web:cache"), Some(&PolicyAction::Disconnected));
    }

    #[tokio::test]
    async fn delete_missing_is_not_found() {
        let h = setup();
        h.cp.set_policy("web:db", PolicyAction::Connected).await.unwrap();
        h.cp.delete_policy("db:web").await.unwrap();
        assert_eq!(h.cp.get_policy("web:db").await.unwrap(), None);

        let err = h.cp.delete_policy("db:web").await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(NotFound::Policy(_))));
    }

    #[tokio::test]
    async fn remap_recanonicalizes() {
        let h = setup();
        h.cp.set_policy("aaa:ccc", PolicyAction::Connected).await.unwrap();
        h.cp.set_policy("aaa:bbb", PolicyAction::Disconnected).await.unwrap();

        // "aaa" becomes "zzz": both keys flip order.
        let report = h.cp.remap_policies(&"aaa".to_string(), &"zzz".to_string()).await.unwrap();
        assert_eq!(report.moved, 2);
        assert!(report.failed.is_empty());

        let names: Vec<String> = h
            .cp
            .store()
            .list(keys::POLICY)
            .await
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["bbb:zzz", "ccc:zzz"]);
        let v = h.cp.store().get("ovgrid/policy/bbb:zzz").await.unwrap().unwrap();
        assert_eq!(v.value, b"DROP");
    }

    #[tokio::test]
    async fn remap_undone_when_stale_delete_fails() {
        let (h, backend) = faulty_harness();
        for (id, name) in [("aaa", "web"), ("bbb", "db"), ("ccc", "cache")] {
            h.engine.add_container(id, name, "");
        }
        h.cp.set_policy("aaa:bbb", PolicyAction::Disconnected).await.unwrap();
        h.cp.set_policy("aaa:ccc", PolicyAction::Connected).await.unwrap();

        backend.fail_deletes("policy/aaa:bbb", 1);
        let report = h.cp.remap_policies(&"aaa".to_string(), &"zzz".to_string()).await.unwrap();
        assert_eq!(report.moved, 1);
        assert_eq!(report.failed, vec!["aaa:bbb"]);

        let names: Vec<String> = h
            .cp
            .store()
            .list(keys::POLICY)
            .await
            .unwrap()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        assert_eq!(names, vec!["aaa:bbb", "ccc:zzz"]);
    }

    #[tokio::test]
    async fn remap_undo_restores_existing_target() {
        let (h, backend) = faulty_harness();
        h.cp.store().put("ovgrid/policy/aaa:bbb", b"DROP").await.unwrap();
        h.cp.store().put("ovgrid/policy/bbb:zzz", b"ACCEPT").await.unwrap();

        backend.fail_deletes("policy/aaa:bbb", 1);
        let report = h.cp.remap_policies(&"aaa".to_string(), &"zzz".to_string()).await.unwrap();
        assert_eq!(report.moved, 0);

        let target = h.cp.store().get("ovgrid/policy/bbb:zzz").await.unwrap().unwrap();
        assert_eq!(target.value, b"ACCEPT");
        let source = h.cp.store().get("ovgrid/policy/aaa:bbb").await.unwrap().unwrap();
        assert_eq!(source.value, b"DROP");
    }
}
