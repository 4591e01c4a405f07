use shared::{domain::ConversationId, error::ProtocolError, protocol::UnsupportedConversation};
use thiserror::Error;

/// Handle construction failed. Kept by the lifecycle controller until the
/// next attempt; calling `initialize` again retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to create protocol client for {identifier}: {source}")]
pub struct CreationError {
    pub identifier: String,
    #[source]
    pub source: ProtocolError,
}

impl CreationError {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

/// Failure of a single directory or session operation. Busy flags are
/// released and previously cached state is left as it was.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("conversation sync failed: {0}")]
    Sync(#[source] ProtocolError),
    #[error("conversation list failed: {0}")]
    List(#[source] ProtocolError),
    #[error("message load failed for conversation {conversation_id}: {source}")]
    Load {
        conversation_id: ConversationId,
        #[source]
        source: ProtocolError,
    },
    #[error("lookup failed: {0}")]
    Lookup(#[source] ProtocolError),
    #[error("conversation creation failed: {0}")]
    Create(#[source] ProtocolError),
    #[error("failed to open {scope} stream: {source}")]
    StreamOpen {
        scope: String,
        #[source]
        source: ProtocolError,
    },
    #[error(transparent)]
    Unsupported(#[from] UnsupportedConversation),
}

impl SyncError {
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            SyncError::Sync(source)
            | SyncError::List(source)
            | SyncError::Lookup(source)
            | SyncError::Create(source) => Some(source),
            SyncError::Load { source, .. } | SyncError::StreamOpen { source, .. } => Some(source),
            SyncError::Unsupported(_) => None,
        }
    }
}
