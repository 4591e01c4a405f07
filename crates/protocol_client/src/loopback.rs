//! In-process network used by the CLI and by tests. Every client created
//! through [`LoopbackFactory`] shares one [`LoopbackNetwork`]; each inbox keeps
//! its own local store that only changes on sync or on stream delivery.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::{
    domain::{
        ConsentState, ConversationId, ConversationType, Identifier, InboxId, MessageId,
        SortDirection,
    },
    error::ProtocolError,
    protocol::{
        ContentType, ConversationMetadata, CreateGroupOptions, ListConversationsOptions,
        MessageListOptions, MessageRecord, RemoteConversation,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    ClientFactory, ClientOptions, ProtocolClient, ProtocolResult, Signer, Subscription,
    SubscriptionSender,
};

const CREATE_CLIENT_CHALLENGE: &[u8] = b"loopback/create-client/v1";

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    offline: bool,
    latency: Option<Duration>,
    identities: HashMap<Identifier, InboxId>,
    conversations: Vec<StoredConversation>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
    local: HashMap<InboxId, LocalStore>,
    conversation_subscribers: Vec<ConversationSubscriber>,
    message_subscribers: Vec<MessageSubscriber>,
}

#[derive(Default)]
struct LocalStore {
    conversations: Vec<ConversationId>,
    messages: HashMap<ConversationId, Vec<MessageRecord>>,
}

#[derive(Clone)]
struct StoredConversation {
    id: ConversationId,
    conversation_type: ConversationType,
    creator: InboxId,
    members: Vec<InboxId>,
    name: Option<String>,
    description: Option<String>,
    image_url: Option<String>,
    created_at: DateTime<Utc>,
}

struct ConversationSubscriber {
    inbox_id: InboxId,
    sender: SubscriptionSender<RemoteConversation>,
}

struct MessageSubscriber {
    inbox_id: InboxId,
    conversation_id: ConversationId,
    sender: SubscriptionSender<MessageRecord>,
}

impl StoredConversation {
    fn has_member(&self, inbox_id: &InboxId) -> bool {
        self.members.iter().any(|member| member == inbox_id)
    }

    fn view_for(&self, viewer: &InboxId) -> RemoteConversation {
        let peer_inbox_id = match self.conversation_type {
            ConversationType::Dm => self
                .members
                .iter()
                .find(|member| *member != viewer)
                .cloned(),
            _ => None,
        };
        RemoteConversation {
            id: self.id.clone(),
            metadata: ConversationMetadata {
                conversation_type: self.conversation_type,
                creator_inbox_id: self.creator.clone(),
            },
            name: self.name.clone(),
            description: self.description.clone(),
            image_url: self.image_url.clone(),
            peer_inbox_id,
            member_inbox_ids: self.members.clone(),
            consent_state: if &self.creator == viewer {
                ConsentState::Allowed
            } else {
                ConsentState::Unknown
            },
            created_at: self.created_at,
        }
    }
}

impl NetworkState {
    fn conversation(&self, conversation_id: &ConversationId) -> Option<&StoredConversation> {
        self.conversations
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
    }

    fn member_conversation(
        &self,
        conversation_id: &ConversationId,
        inbox_id: &InboxId,
    ) -> ProtocolResult<StoredConversation> {
        self.conversation(conversation_id)
            .filter(|conversation| conversation.has_member(inbox_id))
            .cloned()
            .ok_or_else(|| {
                ProtocolError::Other(format!(
                    "conversation {conversation_id} not found for inbox {inbox_id}"
                ))
            })
    }

    fn mark_known(&mut self, inbox_id: &InboxId, conversation_id: &ConversationId) {
        let local = self.local.entry(inbox_id.clone()).or_default();
        if !local.conversations.contains(conversation_id) {
            local.conversations.push(conversation_id.clone());
        }
    }

    fn pull_metadata(&mut self, inbox_id: &InboxId) -> Vec<ConversationId> {
        let ids: Vec<ConversationId> = self
            .conversations
            .iter()
            .filter(|conversation| conversation.has_member(inbox_id))
            .map(|conversation| conversation.id.clone())
            .collect();
        for id in &ids {
            self.mark_known(inbox_id, id);
        }
        ids
    }

    fn pull_messages(&mut self, inbox_id: &InboxId, conversation_id: &ConversationId) {
        let history = self
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        self.local
            .entry(inbox_id.clone())
            .or_default()
            .messages
            .insert(conversation_id.clone(), history);
    }

    fn resolve_inbox(&self, identifier: &Identifier) -> ProtocolResult<InboxId> {
        self.identities
            .get(identifier)
            .cloned()
            .ok_or_else(|| ProtocolError::InvalidIdentifier(identifier.to_string()))
    }

    fn ensure_registered(&self, inbox_id: &InboxId) -> ProtocolResult<()> {
        if self.identities.values().any(|known| known == inbox_id) {
            Ok(())
        } else {
            Err(ProtocolError::InvalidIdentifier(inbox_id.to_string()))
        }
    }

    fn insert_conversation(&mut self, stored: StoredConversation) {
        self.messages.entry(stored.id.clone()).or_default();
        self.mark_known(&stored.creator, &stored.id);
        self.conversations.push(stored.clone());

        let mut delivered = Vec::new();
        self.conversation_subscribers.retain(|subscriber| {
            if !stored.has_member(&subscriber.inbox_id) {
                return !subscriber.sender.is_closed();
            }
            let keep = subscriber
                .sender
                .push(stored.view_for(&subscriber.inbox_id));
            if keep {
                delivered.push(subscriber.inbox_id.clone());
            }
            keep
        });
        for inbox_id in delivered {
            self.mark_known(&inbox_id, &stored.id);
        }
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> LoopbackFactory {
        LoopbackFactory {
            network: self.clone(),
        }
    }

    pub async fn register_identity(&self, identifier: &Identifier) -> InboxId {
        let mut state = self.inner.lock().await;
        state
            .identities
            .entry(identifier.clone())
            .or_insert_with(|| InboxId::new(format!("inbox:{}", identifier.identifier)))
            .clone()
    }

    pub async fn set_offline(&self, offline: bool) {
        self.inner.lock().await.offline = offline;
    }

    pub async fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().await.latency = latency;
    }

    /// Creates a conversation of any type on behalf of `creator` and fans it
    /// out to every member's conversation stream.
    pub async fn create_conversation(
        &self,
        creator: &InboxId,
        conversation_type: ConversationType,
        members: &[InboxId],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation> {
        let mut state = self.inner.lock().await;
        state.ensure_registered(creator)?;
        for member in members {
            state.ensure_registered(member)?;
        }
        let mut all_members = vec![creator.clone()];
        for member in members {
            if !all_members.contains(member) {
                all_members.push(member.clone());
            }
        }
        let stored = StoredConversation {
            id: ConversationId::new(Uuid::new_v4().simple().to_string()),
            conversation_type,
            creator: creator.clone(),
            members: all_members,
            name: options.name.clone(),
            description: options.description.clone(),
            image_url: options.image_url.clone(),
            created_at: Utc::now(),
        };
        debug!(
            conversation_id = %stored.id,
            conversation_type = ?conversation_type,
            members = stored.members.len(),
            "loopback: conversation created"
        );
        let view = stored.view_for(creator);
        state.insert_conversation(stored);
        Ok(view)
    }

    pub async fn publish_message(
        &self,
        conversation_id: &ConversationId,
        sender: &InboxId,
        content_type: ContentType,
        payload: Vec<u8>,
    ) -> ProtocolResult<MessageRecord> {
        let mut state = self.inner.lock().await;
        state.member_conversation(conversation_id, sender)?;
        let message = MessageRecord {
            id: MessageId::new(Uuid::new_v4().simple().to_string()),
            conversation_id: conversation_id.clone(),
            sender_inbox_id: sender.clone(),
            content_type,
            payload,
            sent_at: Utc::now(),
        };
        state
            .messages
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());

        let mut delivered = Vec::new();
        state.message_subscribers.retain(|subscriber| {
            if &subscriber.conversation_id != conversation_id {
                return !subscriber.sender.is_closed();
            }
            let keep = subscriber.sender.push(message.clone());
            if keep {
                delivered.push(subscriber.inbox_id.clone());
            }
            keep
        });
        for inbox_id in delivered {
            state
                .local
                .entry(inbox_id)
                .or_default()
                .messages
                .entry(conversation_id.clone())
                .or_default()
                .push(message.clone());
        }
        Ok(message)
    }

    pub async fn publish_text(
        &self,
        conversation_id: &ConversationId,
        sender: &InboxId,
        text: &str,
    ) -> ProtocolResult<MessageRecord> {
        self.publish_message(
            conversation_id,
            sender,
            ContentType::Text,
            text.as_bytes().to_vec(),
        )
        .await
    }

    /// Terminates every open subscription with `error`.
    pub async fn fail_streams(&self, error: ProtocolError) {
        let mut state = self.inner.lock().await;
        for subscriber in state.conversation_subscribers.drain(..) {
            let _ = subscriber.sender.fail(error.clone());
        }
        for subscriber in state.message_subscribers.drain(..) {
            let _ = subscriber.sender.fail(error.clone());
        }
    }

    /// Live (conversation, message) subscription counts after pruning the ones
    /// whose consumer went away.
    pub async fn live_subscriptions(&self) -> (usize, usize) {
        let mut state = self.inner.lock().await;
        state
            .conversation_subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());
        state
            .message_subscribers
            .retain(|subscriber| !subscriber.sender.is_closed());
        (
            state.conversation_subscribers.len(),
            state.message_subscribers.len(),
        )
    }

    async fn checkpoint(&self) -> ProtocolResult<()> {
        let latency = {
            let state = self.inner.lock().await;
            if state.offline {
                return Err(ProtocolError::Unreachable(
                    "loopback network is offline".to_string(),
                ));
            }
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

/// Signer that answers every challenge locally, or refuses to.
#[derive(Debug, Clone)]
pub struct LoopbackSigner {
    identifier: Identifier,
    reject: bool,
}

impl LoopbackSigner {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            reject: false,
        }
    }

    pub fn rejecting(identifier: Identifier) -> Self {
        Self {
            identifier,
            reject: true,
        }
    }
}

#[async_trait]
impl Signer for LoopbackSigner {
    fn identifier(&self) -> Identifier {
        self.identifier.clone()
    }

    async fn sign_message(&self, message: &[u8]) -> ProtocolResult<Vec<u8>> {
        if self.reject {
            return Err(ProtocolError::SignerRejected(
                "user declined the signature request".to_string(),
            ));
        }
        let mut signature = self.identifier.identifier.as_bytes().to_vec();
        signature.extend_from_slice(message);
        Ok(signature)
    }
}

#[derive(Clone)]
pub struct LoopbackFactory {
    network: LoopbackNetwork,
}

#[async_trait]
impl ClientFactory for LoopbackFactory {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        options: ClientOptions,
    ) -> ProtocolResult<Arc<dyn ProtocolClient>> {
        self.network.checkpoint().await?;
        let identifier = signer.identifier();
        let signature = signer
            .sign_message(CREATE_CLIENT_CHALLENGE)
            .await
            .map_err(|err| match err {
                ProtocolError::SignerRejected(_) => err,
                other => ProtocolError::SignerRejected(other.to_string()),
            })?;
        if signature.is_empty() {
            return Err(ProtocolError::SignerRejected(
                "signer returned an empty signature".to_string(),
            ));
        }

        let inbox_id = self.network.register_identity(&identifier).await;
        info!(
            inbox_id = %inbox_id,
            identifier = %identifier,
            env = %options.env,
            codecs = options.codecs.len(),
            encrypted_store = options.db_encryption_key.is_some(),
            "loopback: client created"
        );
        Ok(Arc::new(LoopbackClient {
            network: self.network.clone(),
            inbox_id,
            identifier,
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct LoopbackClient {
    network: LoopbackNetwork,
    inbox_id: InboxId,
    identifier: Identifier,
    closed: AtomicBool,
}

impl LoopbackClient {
    async fn ready(&self) -> ProtocolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        self.network.checkpoint().await
    }

    async fn create(
        &self,
        conversation_type: ConversationType,
        members: &[InboxId],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation> {
        self.network
            .create_conversation(&self.inbox_id, conversation_type, members, options)
            .await
    }

    async fn resolve(&self, identifier: &Identifier) -> ProtocolResult<InboxId> {
        self.network.inner.lock().await.resolve_inbox(identifier)
    }
}

fn matches_list_options(
    conversation: &RemoteConversation,
    options: &ListConversationsOptions,
) -> bool {
    if let Some(conversation_type) = options.conversation_type {
        if conversation.metadata.conversation_type != conversation_type {
            return false;
        }
    }
    if let Some(consent_states) = &options.consent_states {
        if !consent_states.contains(&conversation.consent_state) {
            return false;
        }
    }
    if let Some(after) = options.created_after {
        if conversation.created_at <= after {
            return false;
        }
    }
    if let Some(before) = options.created_before {
        if conversation.created_at >= before {
            return false;
        }
    }
    true
}

#[async_trait]
impl ProtocolClient for LoopbackClient {
    fn inbox_id(&self) -> InboxId {
        self.inbox_id.clone()
    }

    fn account_identifier(&self) -> Identifier {
        self.identifier.clone()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.network.inner.lock().await;
        state
            .conversation_subscribers
            .retain(|subscriber| subscriber.inbox_id != self.inbox_id);
        state
            .message_subscribers
            .retain(|subscriber| subscriber.inbox_id != self.inbox_id);
        info!(inbox_id = %self.inbox_id, "loopback: client closed");
    }

    async fn list_conversations(
        &self,
        options: &ListConversationsOptions,
    ) -> ProtocolResult<Vec<RemoteConversation>> {
        self.ready().await?;
        let state = self.network.inner.lock().await;
        let Some(local) = state.local.get(&self.inbox_id) else {
            return Ok(Vec::new());
        };
        let mut conversations: Vec<RemoteConversation> = local
            .conversations
            .iter()
            .filter_map(|id| state.conversation(id))
            .map(|stored| stored.view_for(&self.inbox_id))
            .filter(|conversation| matches_list_options(conversation, options))
            .collect();
        conversations.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = options.limit {
            conversations.truncate(limit);
        }
        Ok(conversations)
    }

    async fn sync_conversations(&self) -> ProtocolResult<()> {
        self.ready().await?;
        let mut state = self.network.inner.lock().await;
        let ids = state.pull_metadata(&self.inbox_id);
        debug!(inbox_id = %self.inbox_id, count = ids.len(), "loopback: metadata synced");
        Ok(())
    }

    async fn sync_all_conversations(&self) -> ProtocolResult<()> {
        self.ready().await?;
        let mut state = self.network.inner.lock().await;
        let ids = state.pull_metadata(&self.inbox_id);
        for id in &ids {
            state.pull_messages(&self.inbox_id, id);
        }
        debug!(inbox_id = %self.inbox_id, count = ids.len(), "loopback: full sync complete");
        Ok(())
    }

    async fn get_conversation_by_id(
        &self,
        conversation_id: &ConversationId,
    ) -> ProtocolResult<Option<RemoteConversation>> {
        self.ready().await?;
        let state = self.network.inner.lock().await;
        let known = state
            .local
            .get(&self.inbox_id)
            .is_some_and(|local| local.conversations.contains(conversation_id));
        if !known {
            return Ok(None);
        }
        Ok(state
            .conversation(conversation_id)
            .map(|stored| stored.view_for(&self.inbox_id)))
    }

    async fn get_message_by_id(
        &self,
        message_id: &MessageId,
    ) -> ProtocolResult<Option<MessageRecord>> {
        self.ready().await?;
        let state = self.network.inner.lock().await;
        Ok(state.local.get(&self.inbox_id).and_then(|local| {
            local
                .messages
                .values()
                .flatten()
                .find(|message| &message.id == message_id)
                .cloned()
        }))
    }

    async fn new_group(
        &self,
        inbox_ids: &[InboxId],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation> {
        self.ready().await?;
        self.create(ConversationType::Group, inbox_ids, options).await
    }

    async fn new_group_with_identifiers(
        &self,
        identifiers: &[Identifier],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation> {
        self.ready().await?;
        let mut inbox_ids = Vec::with_capacity(identifiers.len());
        for identifier in identifiers {
            inbox_ids.push(self.resolve(identifier).await?);
        }
        self.create(ConversationType::Group, &inbox_ids, options)
            .await
    }

    async fn new_dm(&self, inbox_id: &InboxId) -> ProtocolResult<RemoteConversation> {
        self.ready().await?;
        if inbox_id == &self.inbox_id {
            return Err(ProtocolError::InvalidIdentifier(
                "cannot open a direct message with yourself".to_string(),
            ));
        }
        {
            let mut state = self.network.inner.lock().await;
            let existing = state
                .conversations
                .iter()
                .find(|conversation| {
                    conversation.conversation_type == ConversationType::Dm
                        && conversation.has_member(&self.inbox_id)
                        && conversation.has_member(inbox_id)
                })
                .cloned();
            if let Some(existing) = existing {
                state.mark_known(&self.inbox_id, &existing.id);
                return Ok(existing.view_for(&self.inbox_id));
            }
        }
        self.create(
            ConversationType::Dm,
            std::slice::from_ref(inbox_id),
            &CreateGroupOptions::default(),
        )
        .await
    }

    async fn new_dm_with_identifier(
        &self,
        identifier: &Identifier,
    ) -> ProtocolResult<RemoteConversation> {
        let inbox_id = self.resolve(identifier).await?;
        self.new_dm(&inbox_id).await
    }

    async fn stream_conversations(&self) -> ProtocolResult<Subscription<RemoteConversation>> {
        self.ready().await?;
        let (sender, subscription) = Subscription::channel();
        self.network
            .inner
            .lock()
            .await
            .conversation_subscribers
            .push(ConversationSubscriber {
                inbox_id: self.inbox_id.clone(),
                sender,
            });
        Ok(subscription)
    }

    async fn sync_conversation(&self, conversation_id: &ConversationId) -> ProtocolResult<()> {
        self.ready().await?;
        let mut state = self.network.inner.lock().await;
        state.member_conversation(conversation_id, &self.inbox_id)?;
        state.mark_known(&self.inbox_id, conversation_id);
        state.pull_messages(&self.inbox_id, conversation_id);
        Ok(())
    }

    async fn conversation_messages(
        &self,
        conversation_id: &ConversationId,
        options: &MessageListOptions,
    ) -> ProtocolResult<Vec<MessageRecord>> {
        self.ready().await?;
        let state = self.network.inner.lock().await;
        let mut messages: Vec<MessageRecord> = state
            .local
            .get(&self.inbox_id)
            .and_then(|local| local.messages.get(conversation_id))
            .map(|history| {
                history
                    .iter()
                    .filter(|message| {
                        options
                            .sent_after
                            .map_or(true, |after| message.sent_at > after)
                    })
                    .filter(|message| {
                        options
                            .sent_before
                            .map_or(true, |before| message.sent_at < before)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at));
        if options.direction == SortDirection::Descending {
            messages.reverse();
        }
        if let Some(limit) = options.limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    async fn stream_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ProtocolResult<Subscription<MessageRecord>> {
        self.ready().await?;
        let mut state = self.network.inner.lock().await;
        state.member_conversation(conversation_id, &self.inbox_id)?;
        let (sender, subscription) = Subscription::channel();
        state.message_subscribers.push(MessageSubscriber {
            inbox_id: self.inbox_id.clone(),
            conversation_id: conversation_id.clone(),
            sender,
        });
        Ok(subscription)
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
