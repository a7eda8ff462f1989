//! Container groups: plain directory markers with member markers below.

use ovgrid_state::keys;
use tracing::info;

use crate::ControlPlane;
use crate::error::{Conflict, ControlError, ControlResult, NotFound};

fn validate_segment(kind: &str, value: &str) -> ControlResult<()> {
    if value.is_empty() || value.contains('/') {
        return Err(ControlError::Validation(format!(
            "{kind} name must be non-empty and must not contain '/'"
        )));
    }
    Ok(())
}

impl ControlPlane {
    pub async fn list_groups(&self) -> ControlResult<Vec<String>> {
        Ok(self
            .store
            .list(keys::GROUPS)
            .await?
            .iter()
            .map(|p| p.name().to_string())
            .collect())
    }

    pub async fn create_group(&self, name: &str) -> ControlResult<()> {
        validate_segment("group", name)?;
        let key = keys::group(name);
        if self.store.exists(&key).await? {
            return Err(Conflict::GroupExists(name.to_string()).into());
        }
        self.store.put_tree(&key).await?;
        info!(group = %name, "group created");
        Ok(())
    }

    async fn require_group(&self, name: &str) -> ControlResult<String> {
        let key = keys::group(name);
        if !self.store.exists(&key).await? {
            return Err(NotFound::Group(name.to_string()).into());
        }
        Ok(key)
    }

    pub async fn group_members(&self, name: &str) -> ControlResult<Vec<String>> {
        let key = self.require_group(name).await?;
        Ok(self
            .store
            .list(&key)
            .await?
            .iter()
            .map(|p| p.name().to_string())
            .collect())
    }

    pub async fn delete_group(&self, name: &str) -> ControlResult<()> {
        let key = self.require_group(name).await?;
        self.store.delete_tree(&key).await?;
        info!(group = %name, "group deleted");
        Ok(())
    }

    pub async fn add_member(&self, group: &str, member: &str) -> ControlResult<()> {
        validate_segment("member", member)?;
        self.require_group(group).await?;
        self.store.put_tree(&keys::member(group, member)).await?;
        info!(%group, %member, "group member added");
        Ok(())
    }

    pub async fn remove_member(&self, group: &str, member: &str) -> ControlResult<()> {
        self.require_group(group).await?;
        self.store.delete_tree(&keys::member(group, member)).await?;
        info!(%group, %member, "group member removed");
        Ok(())
    }
}
