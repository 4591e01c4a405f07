//! Change notifications for readers of cached state.

use shared::{
    domain::ConversationId,
    error::ProtocolError,
    protocol::{ConversationRecord, MessageRecord},
};

pub(crate) const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    ConversationsReplaced { count: usize },
    ConversationAdded(ConversationRecord),
    StreamEnded { error: Option<ProtocolError> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TargetChanged {
        conversation_id: ConversationId,
    },
    MessagesReplaced {
        conversation_id: ConversationId,
        count: usize,
    },
    MessageAppended(MessageRecord),
    TitleChanged(String),
    StreamEnded {
        conversation_id: ConversationId,
        error: Option<ProtocolError>,
    },
}
