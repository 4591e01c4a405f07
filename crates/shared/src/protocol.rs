use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    ConsentState, ConversationId, ConversationType, GroupPermissionsPreset, InboxId, MessageId,
    SortDirection,
};

pub const UNTITLED_GROUP_NAME: &str = "Untitled";
pub const DIRECT_MESSAGE_TITLE: &str = "Direct message";

/// Content types the client registers codecs for. Only the schema lives here;
/// encoding is handled by the protocol client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Text,
    Reaction,
    Reply,
    Attachment,
    RemoteAttachment,
    TransactionReference,
    WalletSendCalls,
    GroupUpdated,
    Custom(String),
}

impl ContentType {
    pub fn type_id(&self) -> &str {
        match self {
            ContentType::Text => "xmtp.org/text:1.0",
            ContentType::Reaction => "xmtp.org/reaction:1.0",
            ContentType::Reply => "xmtp.org/reply:1.0",
            ContentType::Attachment => "xmtp.org/attachment:1.0",
            ContentType::RemoteAttachment => "xmtp.org/remoteStaticAttachment:1.0",
            ContentType::TransactionReference => "xmtp.org/transactionReference:1.0",
            ContentType::WalletSendCalls => "xmtp.org/walletSendCalls:1.0",
            ContentType::GroupUpdated => "xmtp.org/group_updated:1.0",
            ContentType::Custom(type_id) => type_id,
        }
    }

    /// Codecs registered on every client in addition to the built-in text
    /// and group-update codecs.
    pub fn default_codecs() -> Vec<ContentType> {
        vec![
            ContentType::Reaction,
            ContentType::Reply,
            ContentType::Attachment,
            ContentType::RemoteAttachment,
            ContentType::TransactionReference,
            ContentType::WalletSendCalls,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMetadata {
    pub conversation_type: ConversationType,
    pub creator_inbox_id: InboxId,
}

/// A conversation as the protocol client hands it out, before the kind check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConversation {
    pub id: ConversationId,
    pub metadata: ConversationMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_inbox_id: Option<InboxId>,
    #[serde(default)]
    pub member_inbox_ids: Vec<InboxId>,
    #[serde(default)]
    pub consent_state: ConsentState,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationKind {
    Dm {
        peer_inbox_id: InboxId,
    },
    Group {
        #[serde(default)]
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image_url: Option<String>,
        #[serde(default)]
        member_inbox_ids: Vec<InboxId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub kind: ConversationKind,
    pub creator_inbox_id: InboxId,
    #[serde(default)]
    pub consent_state: ConsentState,
    pub created_at: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group { .. })
    }

    pub fn display_name(&self) -> String {
        match &self.kind {
            ConversationKind::Group { name, .. } if !name.trim().is_empty() => name.clone(),
            ConversationKind::Group { .. } => UNTITLED_GROUP_NAME.to_string(),
            ConversationKind::Dm { .. } => DIRECT_MESSAGE_TITLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnsupportedConversation {
    #[error("conversation {id} has unsupported type {conversation_type:?}")]
    UnsupportedType {
        id: ConversationId,
        conversation_type: ConversationType,
    },
    #[error("dm conversation {id} has no peer inbox")]
    MissingPeer { id: ConversationId },
}

impl TryFrom<RemoteConversation> for ConversationRecord {
    type Error = UnsupportedConversation;

    fn try_from(remote: RemoteConversation) -> Result<Self, Self::Error> {
        let kind = match remote.metadata.conversation_type {
            ConversationType::Dm => ConversationKind::Dm {
                peer_inbox_id: remote
                    .peer_inbox_id
                    .ok_or_else(|| UnsupportedConversation::MissingPeer {
                        id: remote.id.clone(),
                    })?,
            },
            ConversationType::Group => ConversationKind::Group {
                name: remote.name.unwrap_or_default(),
                description: remote.description,
                image_url: remote.image_url,
                member_inbox_ids: remote.member_inbox_ids,
            },
            other => {
                return Err(UnsupportedConversation::UnsupportedType {
                    id: remote.id,
                    conversation_type: other,
                })
            }
        };

        Ok(Self {
            id: remote.id,
            kind,
            creator_inbox_id: remote.metadata.creator_inbox_id,
            consent_state: remote.consent_state,
            created_at: remote.created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_inbox_id: InboxId,
    pub content_type: ContentType,
    pub payload: Vec<u8>,
    pub sent_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn text(&self) -> Option<String> {
        (self.content_type == ContentType::Text)
            .then(|| String::from_utf8_lossy(&self.payload).to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListConversationsOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent_states: Option<Vec<ConsentState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_type: Option<ConversationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateGroupOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub permissions: GroupPermissionsPreset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageListOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub direction: SortDirection,
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
