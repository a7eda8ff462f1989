//! ovgrid-control: the control-plane engine.
//!
//! Operators call into [`ControlPlane`], which reads and writes registry
//! records through the coordination [`Store`] and calls the container
//! engine and the SDN controller. Nothing is cached between calls: every
//! decision re-reads the registry.
//!
//! # Architecture
//!
//! ```text
//! ControlPlane
//!   ├── Store                       (ovgrid-state)
//!   ├── Arc<dyn ContainerEngine>    (DockerClient | FakeEngine)
//!   ├── Arc<dyn SdnController>      (OfcClient | FakeSdn)
//!   └── TaskRunner                  (fire-and-forget background work)
//! ```
//!
//! Operations are grouped by record kind: [`gateway`], [`firewall`],
//! [`policy`], [`group`], plus [`migration`] and [`container`].

pub mod container;
pub mod engine;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod group;
pub mod migration;
pub mod policy;
pub mod sdn;
pub mod tasks;
pub mod testing;

use std::sync::Arc;

use ovgrid_state::{Store, keys};
use tracing::info;

pub use container::ContainerNetwork;
pub use engine::{ContainerEngine, ContainerInfo, CreateSpec, DockerClient};
pub use error::{Conflict, ControlError, ControlResult, NotFound};
pub use migration::RemapReport;
pub use sdn::{OfcClient, SdnController, SdnEndpoint};
pub use tasks::TaskRunner;

/// Handle shared by every request handler. Cloning is cheap.
#[derive(Clone)]
pub struct ControlPlane {
    store: Store,
    engine: Arc<dyn ContainerEngine>,
    sdn: Arc<dyn SdnController>,
    tasks: TaskRunner,
    hostname: String,
}

impl ControlPlane {
    pub fn new(
        store: Store,
        engine: Arc<dyn ContainerEngine>,
        sdn: Arc<dyn SdnController>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            store,
            engine,
            sdn,
            tasks: TaskRunner::new(),
            hostname: hostname.into(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tasks(&self) -> &TaskRunner {
        &self.tasks
    }

    /// Host name used to pick a local gateway when no node hint is given.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Create the record directories the control plane writes into.
    pub async fn init(&self) -> ControlResult<()> {
        for dir in keys::CONTROL_DIRS {
            if !self.store.exists(dir).await? {
                self.store.put_tree(dir).await?;
                info!(%dir, "registry directory created");
            }
        }
        Ok(())
    }
}
