//! Scripted protocol client for driving interleavings by hand.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use protocol_client::{
    ClientFactory, ClientOptions, ProtocolClient, ProtocolResult, Signer, Subscription,
    SubscriptionSender,
};
use shared::{
    domain::{
        ConsentState, ConversationId, ConversationType, Identifier, InboxId, MessageId,
    },
    error::ProtocolError,
    protocol::{
        ContentType, ConversationMetadata, CreateGroupOptions, ListConversationsOptions,
        MessageListOptions, MessageRecord, RemoteConversation,
    },
};
use tokio::sync::Notify;

pub(crate) const OWNER: &str = "inbox:owner";

/// Pauses a scripted call. `entered` fires once the call is waiting; the
/// call proceeds after `release`.
#[derive(Default)]
pub(crate) struct Gate {
    entered: Notify,
    release: Notify,
}

impl Gate {
    pub(crate) async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub(crate) fn release(&self) {
        self.release.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.release.notified().await;
    }
}

#[derive(Default)]
pub(crate) struct FakeClient {
    calls: StdMutex<Vec<String>>,
    conversations: StdMutex<Vec<RemoteConversation>>,
    messages: StdMutex<HashMap<ConversationId, Vec<MessageRecord>>>,
    failures: StdMutex<HashMap<String, ProtocolError>>,
    gates: StdMutex<HashMap<String, Arc<Gate>>>,
    conversation_senders: StdMutex<Vec<SubscriptionSender<RemoteConversation>>>,
    message_senders: StdMutex<Vec<(ConversationId, SubscriptionSender<MessageRecord>)>>,
    closed: AtomicBool,
}

impl FakeClient {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn handle(self: &Arc<Self>) -> Arc<dyn ProtocolClient> {
        self.clone()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|entry| entry.as_str() == call).count()
    }

    pub(crate) fn set_conversations(&self, conversations: Vec<RemoteConversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub(crate) fn set_messages(&self, conversation_id: &str, messages: Vec<MessageRecord>) {
        self.messages
            .lock()
            .unwrap()
            .insert(ConversationId::from(conversation_id), messages);
    }

    /// Makes every later call named `call` fail with `error`.
    pub(crate) fn fail(&self, call: &str, error: ProtocolError) {
        self.failures.lock().unwrap().insert(call.to_string(), error);
    }

    pub(crate) fn heal(&self, call: &str) {
        self.failures.lock().unwrap().remove(call);
    }

    /// Pauses the next call named `call` until the gate is released.
    pub(crate) fn gate(&self, call: &str) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap()
            .insert(call.to_string(), gate.clone());
        gate
    }

    pub(crate) fn push_conversation(&self, conversation: RemoteConversation) {
        for sender in self.conversation_senders.lock().unwrap().iter() {
            sender.push(conversation.clone());
        }
    }

    pub(crate) fn fail_conversation_stream(&self, error: ProtocolError) {
        for sender in self.conversation_senders.lock().unwrap().drain(..) {
            sender.fail(error.clone());
        }
    }

    pub(crate) fn fail_message_streams(&self, error: ProtocolError) {
        for (_, sender) in self.message_senders.lock().unwrap().drain(..) {
            sender.fail(error.clone());
        }
    }

    /// Pushes to every message subscriber, live or not, regardless of the
    /// conversation it asked for.
    pub(crate) fn push_message_to_all(&self, message: MessageRecord) {
        for (_, sender) in self.message_senders.lock().unwrap().iter() {
            sender.push(message.clone());
        }
    }

    pub(crate) fn push_message(&self, message: MessageRecord) {
        for (conversation_id, sender) in self.message_senders.lock().unwrap().iter() {
            if conversation_id == &message.conversation_id {
                sender.push(message.clone());
            }
        }
    }

    pub(crate) fn live_conversation_streams(&self) -> usize {
        self.conversation_senders
            .lock()
            .unwrap()
            .iter()
            .filter(|sender| !sender.is_closed())
            .count()
    }

    pub(crate) fn live_message_streams(&self) -> usize {
        self.message_senders
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, sender)| !sender.is_closed())
            .count()
    }

    async fn enter(&self, call: String) -> ProtocolResult<()> {
        self.calls.lock().unwrap().push(call.clone());
        let gate = self.gates.lock().unwrap().remove(&call);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::Closed);
        }
        let name = call.split(':').next().unwrap_or_default().to_string();
        let failure = {
            let failures = self.failures.lock().unwrap();
            failures
                .get(&call)
                .or_else(|| failures.get(&name))
                .cloned()
        };
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    fn inbox_id(&self) -> InboxId {
        InboxId::from(OWNER)
    }

    fn account_identifier(&self) -> Identifier {
        Identifier::ethereum("0x0wner")
    }

    async fn close(&self) {
        self.calls.lock().unwrap().push("close".to_string());
        self.closed.store(true, Ordering::SeqCst);
    }

    async fn list_conversations(
        &self,
        _options: &ListConversationsOptions,
    ) -> ProtocolResult<Vec<RemoteConversation>> {
        self.enter("list_conversations".to_string()).await?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn sync_conversations(&self) -> ProtocolResult<()> {
        self.enter("sync_conversations".to_string()).await
    }

    async fn sync_all_conversations(&self) -> ProtocolResult<()> {
        self.enter("sync_all_conversations".to_string()).await
    }

    async fn get_conversation_by_id(
        &self,
        conversation_id: &ConversationId,
    ) -> ProtocolResult<Option<RemoteConversation>> {
        self.enter(format!("get_conversation_by_id:{conversation_id}"))
            .await?;
        Ok(self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .find(|conversation| &conversation.id == conversation_id)
            .cloned())
    }

    async fn get_message_by_id(
        &self,
        message_id: &MessageId,
    ) -> ProtocolResult<Option<MessageRecord>> {
        self.enter(format!("get_message_by_id:{message_id}")).await?;
        Ok(self
            .messages
            .lock()
            .unwrap()
            .values()
            .flatten()
            .find(|message| &message.id == message_id)
            .cloned())
    }

    async fn new_group(
        &self,
        inbox_ids: &[InboxId],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation> {
        self.enter("new_group".to_string()).await?;
        let mut created = group("created-group", options.name.as_deref().unwrap_or_default(), 100);
        created.member_inbox_ids = inbox_ids.to_vec();
        Ok(created)
    }

    async fn new_group_with_identifiers(
        &self,
        identifiers: &[Identifier],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation> {
        self.enter("new_group_with_identifiers".to_string()).await?;
        let mut created = group(
            "created-group-by-identifier",
            options.name.as_deref().unwrap_or_default(),
            100,
        );
        created.member_inbox_ids = identifiers
            .iter()
            .map(|identifier| InboxId::new(format!("inbox:{}", identifier.identifier)))
            .collect();
        Ok(created)
    }

    async fn new_dm(&self, inbox_id: &InboxId) -> ProtocolResult<RemoteConversation> {
        self.enter("new_dm".to_string()).await?;
        Ok(dm("created-dm", inbox_id.as_str(), 100))
    }

    async fn new_dm_with_identifier(
        &self,
        identifier: &Identifier,
    ) -> ProtocolResult<RemoteConversation> {
        self.enter("new_dm_with_identifier".to_string()).await?;
        Ok(dm(
            "created-dm-by-identifier",
            &format!("inbox:{}", identifier.identifier),
            100,
        ))
    }

    async fn stream_conversations(&self) -> ProtocolResult<Subscription<RemoteConversation>> {
        self.enter("stream_conversations".to_string()).await?;
        let (sender, subscription) = Subscription::channel();
        self.conversation_senders.lock().unwrap().push(sender);
        Ok(subscription)
    }

    async fn sync_conversation(&self, conversation_id: &ConversationId) -> ProtocolResult<()> {
        self.enter(format!("sync_conversation:{conversation_id}"))
            .await
    }

    async fn conversation_messages(
        &self,
        conversation_id: &ConversationId,
        options: &MessageListOptions,
    ) -> ProtocolResult<Vec<MessageRecord>> {
        self.enter(format!("conversation_messages:{conversation_id}"))
            .await?;
        let mut messages = self
            .messages
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default();
        if let Some(limit) = options.limit {
            messages.truncate(limit);
        }
        Ok(messages)
    }

    async fn stream_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ProtocolResult<Subscription<MessageRecord>> {
        // Recorded with the number of message streams still live at open time.
        let live = self.live_message_streams();
        self.enter(format!("stream_messages:{conversation_id}")).await?;
        self.calls
            .lock()
            .unwrap()
            .push(format!("live_before_open:{live}"));
        let (sender, subscription) = Subscription::channel();
        self.message_senders
            .lock()
            .unwrap()
            .push((conversation_id.clone(), sender));
        Ok(subscription)
    }
}

/// Hands out scripted outcomes in order, then the fallback client.
pub(crate) struct FakeFactory {
    client: Arc<FakeClient>,
    outcomes: StdMutex<VecDeque<ProtocolError>>,
    gate: StdMutex<Option<Arc<Gate>>>,
    attempts: AtomicUsize,
    created: AtomicUsize,
}

impl FakeFactory {
    pub(crate) fn new(client: Arc<FakeClient>) -> Arc<Self> {
        Arc::new(Self {
            client,
            outcomes: StdMutex::new(VecDeque::new()),
            gate: StdMutex::new(None),
            attempts: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
        })
    }

    pub(crate) fn fail_next(&self, error: ProtocolError) {
        self.outcomes.lock().unwrap().push_back(error);
    }

    pub(crate) fn gate_next(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClientFactory for FakeFactory {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        _options: ClientOptions,
    ) -> ProtocolResult<Arc<dyn ProtocolClient>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        signer.sign_message(b"fake/create").await?;
        if let Some(error) = self.outcomes.lock().unwrap().pop_front() {
            return Err(error);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.client.clone())
    }
}

pub(crate) struct FakeSigner;

#[async_trait]
impl Signer for FakeSigner {
    fn identifier(&self) -> Identifier {
        Identifier::ethereum("0x0wner")
    }

    async fn sign_message(&self, message: &[u8]) -> ProtocolResult<Vec<u8>> {
        Ok(message.to_vec())
    }
}

pub(crate) fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

fn remote(id: &str, conversation_type: ConversationType, seconds: i64) -> RemoteConversation {
    RemoteConversation {
        id: ConversationId::from(id),
        metadata: ConversationMetadata {
            conversation_type,
            creator_inbox_id: InboxId::from(OWNER),
        },
        name: None,
        description: None,
        image_url: None,
        peer_inbox_id: None,
        member_inbox_ids: Vec::new(),
        consent_state: ConsentState::Allowed,
        created_at: at(seconds),
    }
}

pub(crate) fn group(id: &str, name: &str, seconds: i64) -> RemoteConversation {
    RemoteConversation {
        name: Some(name.to_string()),
        member_inbox_ids: vec![InboxId::from(OWNER)],
        ..remote(id, ConversationType::Group, seconds)
    }
}

pub(crate) fn dm(id: &str, peer: &str, seconds: i64) -> RemoteConversation {
    RemoteConversation {
        peer_inbox_id: Some(InboxId::from(peer)),
        ..remote(id, ConversationType::Dm, seconds)
    }
}

pub(crate) fn sync_group(id: &str) -> RemoteConversation {
    remote(id, ConversationType::Sync, 0)
}

pub(crate) fn record(conversation: RemoteConversation) -> shared::protocol::ConversationRecord {
    conversation.try_into().unwrap()
}

pub(crate) fn message(conversation_id: &str, id: &str, text: &str, seconds: i64) -> MessageRecord {
    MessageRecord {
        id: MessageId::from(id),
        conversation_id: ConversationId::from(conversation_id),
        sender_inbox_id: InboxId::from("inbox:peer"),
        content_type: ContentType::Text,
        payload: text.as_bytes().to_vec(),
        sent_at: at(seconds),
    }
}

pub(crate) fn ids<T, F>(items: &[T], id: F) -> Vec<String>
where
    F: Fn(&T) -> String,
{
    items.iter().map(id).collect()
}
