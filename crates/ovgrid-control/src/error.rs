//! Error types for control-plane operations.

use ovgrid_state::StoreError;
use thiserror::Error;

/// Result type alias for control-plane operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors surfaced to control-plane callers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error("coordination backend error: {0}")]
    Store(#[from] StoreError),

    #[error("container engine error: {0}")]
    Engine(String),

    #[error("sdn controller error: {0}")]
    Sdn(String),

    /// A rollback step failed; the original and the replacement may now
    /// both hold part of the container's state.
    #[error("compensation step '{step}' failed: {source}")]
    Compensation {
        step: &'static str,
        #[source]
        source: Box<ControlError>,
    },
}

/// Uniqueness violations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Conflict {
    #[error("firewall name already exists: {0}")]
    FirewallName(String),

    #[error("firewall gateway port already exists: {datapath_id}/{port}")]
    FirewallPort { datapath_id: String, port: u16 },

    #[error("policy should not pair a container with itself: {0}")]
    PolicySelfPair(String),

    #[error("group already exists: {0}")]
    GroupExists(String),
}

/// Missing records or collaborators' objects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotFound {
    #[error("gateway does not exist")]
    Gateway,

    #[error("firewall does not exist: {0}")]
    Firewall(String),

    #[error("group does not exist: {0}")]
    Group(String),

    #[error("policy does not exist: {0}")]
    Policy(String),

    #[error("container does not exist: {0}")]
    Container(String),
}
