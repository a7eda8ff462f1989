//! ovgrid-agent: per-node reconciliation of overlay devices.
//!
//! Each node runs one [`NodeAgent`]. It publishes the node's gateway
//! record and converges the OVS bridge to the networks the container
//! engine has declared in the registry.
//!
//! # Architecture
//!
//! ```text
//! NodeAgent
//!   ├── Store (ovgrid-state)       gateway registration, network watch
//!   └── Reconciler
//!         └── Arc<dyn NodeNetwork>
//!               └── HostNetwork ── Ovs / Ip / Iptables ── Arc<dyn CommandRunner>
//! ```

pub mod agent;
pub mod error;
pub mod exec;
pub mod host;
pub mod ip;
pub mod iptables;
pub mod ovs;
pub mod reconcile;
pub mod testing;
pub mod topology;

pub use agent::{AgentConfig, NodeAgent, REGISTRATION_TTL};
pub use error::{AgentError, AgentResult};
pub use exec::{CommandRunner, SystemRunner};
pub use host::{HostNetwork, NodeNetwork};
pub use reconcile::{ReconcileReport, Reconciler};
pub use topology::{NETWORK_TYPE, desired_devices, device_name};
