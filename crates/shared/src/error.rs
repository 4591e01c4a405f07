use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the protocol client. `Clone` so the lifecycle
/// controller can keep the last creation failure around for readers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum ProtocolError {
    #[error("signer rejected: {0}")]
    SignerRejected(String),
    #[error("network unreachable: {0}")]
    Unreachable(String),
    #[error("local storage failure: {0}")]
    Storage(String),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("stream failure: {0}")]
    Stream(String),
    #[error("client handle is closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

impl ProtocolError {
    /// Whether calling the same operation again can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Unreachable(_) | ProtocolError::Stream(_) | ProtocolError::Storage(_)
        )
    }
}
