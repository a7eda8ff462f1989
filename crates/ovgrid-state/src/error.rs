//! Error types for the coordination facade.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to a coordination backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unsupported backend scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid discovery uri: {0}")]
    InvalidUri(String),

    #[error("failed to open backend: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("backend request failed: {0}")]
    Backend(#[from] ovgrid_client::ClientError),

    #[error("watch on {0} closed")]
    WatchClosed(String),
}
