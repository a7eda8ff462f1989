//! Error types for outbound HTTP requests.

use thiserror::Error;

/// Result type alias for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur while talking to an HTTP collaborator.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("tls configuration error: {0}")]
    Tls(String),

    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    /// HTTP status carried by the error, if the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}
