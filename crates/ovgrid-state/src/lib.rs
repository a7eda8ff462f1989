//! ovgrid-state: the shared registry behind ovgrid.
//!
//! Every component coordinates through one hierarchical key/value store:
//! agents register gateways and watch network topology, the control plane
//! reads and writes firewall, policy and group records.
//!
//! # Architecture
//!
//! ```text
//! BackendRegistry::open("etcd://h1,h2/prefix")
//!   └── Store (prefix, registration root, heartbeat, ttl)
//!         └── Arc<dyn KvBackend>
//!               ├── MemoryBackend  (memory://)
//!               ├── RedbBackend    (redb://<path>)
//!               └── EtcdBackend    (etcd://<addr>[,...])
//! ```
//!
//! Records are JSON with the field names the SDN controller expects; see
//! [`types`]. Key layout lives in [`keys`].

pub mod backend;
pub mod error;
pub mod etcd;
pub mod keys;
pub mod memory;
pub mod redb_backend;
pub mod registry;
pub mod store;
pub mod tables;
pub mod types;
mod watch;

pub use backend::{KvBackend, KvPair, SnapshotReceiver};
pub use error::{StoreError, StoreResult};
pub use etcd::EtcdBackend;
pub use memory::MemoryBackend;
pub use redb_backend::RedbBackend;
pub use registry::{BackendFactory, BackendOptions, BackendRegistry, DiscoveryUri};
pub use store::Store;
pub use types::*;
