use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, Identifier, InboxId, MessageId},
    error::ProtocolError,
    protocol::{
        ContentType, CreateGroupOptions, ListConversationsOptions, MessageListOptions,
        MessageRecord, RemoteConversation,
    },
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

pub mod loopback;

pub type ProtocolResult<T> = Result<T, ProtocolError>;

pub const DB_ENCRYPTION_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Env {
    Local,
    #[default]
    Dev,
    Production,
}

impl FromStr for Env {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Env::Local),
            "dev" => Ok(Env::Dev),
            "production" | "prod" => Ok(Env::Production),
            other => Err(format!("unknown env '{other}'")),
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Env::Local => "local",
            Env::Dev => "dev",
            Env::Production => "production",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown logging level '{other}'")),
        }
    }
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Options handed to [`ClientFactory::create`].
#[derive(Clone)]
pub struct ClientOptions {
    pub env: Env,
    pub logging_level: Option<LogLevel>,
    pub db_encryption_key: Option<[u8; DB_ENCRYPTION_KEY_LEN]>,
    pub codecs: Vec<ContentType>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            env: Env::default(),
            logging_level: None,
            db_encryption_key: None,
            codecs: ContentType::default_codecs(),
        }
    }
}

// Keeps the database key out of logs.
impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("env", &self.env)
            .field("logging_level", &self.logging_level)
            .field("db_encryption_key", &self.db_encryption_key.map(|_| "<redacted>"))
            .field("codecs", &self.codecs)
            .finish()
    }
}

#[async_trait]
pub trait Signer: Send + Sync {
    fn identifier(&self) -> Identifier;
    async fn sign_message(&self, message: &[u8]) -> ProtocolResult<Vec<u8>>;
}

pub type StreamEvent<T> = ProtocolResult<T>;

/// Producer half of a push subscription.
pub struct SubscriptionSender<T> {
    tx: mpsc::UnboundedSender<StreamEvent<T>>,
}

impl<T> Clone for SubscriptionSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> SubscriptionSender<T> {
    /// Returns false once the consumer side is gone.
    pub fn push(&self, item: T) -> bool {
        self.tx.send(Ok(item)).is_ok()
    }

    /// Delivers a terminal error. Nothing should be pushed afterwards.
    pub fn fail(&self, error: ProtocolError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of a push subscription. Dropping or closing it unsubscribes;
/// items already queued may still be drained.
pub struct Subscription<T> {
    events: mpsc::UnboundedReceiver<StreamEvent<T>>,
}

impl<T> Subscription<T> {
    pub fn channel() -> (SubscriptionSender<T>, Subscription<T>) {
        let (tx, events) = mpsc::unbounded_channel();
        (SubscriptionSender { tx }, Subscription { events })
    }

    pub async fn next(&mut self) -> Option<StreamEvent<T>> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        self.events.close();
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<StreamEvent<T>> {
        UnboundedReceiverStream::new(self.events)
    }
}

/// An authenticated protocol client with its local encrypted store.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn inbox_id(&self) -> InboxId;
    fn account_identifier(&self) -> Identifier;
    async fn close(&self);

    async fn list_conversations(
        &self,
        options: &ListConversationsOptions,
    ) -> ProtocolResult<Vec<RemoteConversation>>;
    /// Pulls conversation metadata (new welcomes) without message history.
    async fn sync_conversations(&self) -> ProtocolResult<()>;
    /// Pulls conversation metadata and the message history of every conversation.
    async fn sync_all_conversations(&self) -> ProtocolResult<()>;
    async fn get_conversation_by_id(
        &self,
        conversation_id: &ConversationId,
    ) -> ProtocolResult<Option<RemoteConversation>>;
    async fn get_message_by_id(&self, message_id: &MessageId)
        -> ProtocolResult<Option<MessageRecord>>;
    async fn new_group(
        &self,
        inbox_ids: &[InboxId],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation>;
    async fn new_group_with_identifiers(
        &self,
        identifiers: &[Identifier],
        options: &CreateGroupOptions,
    ) -> ProtocolResult<RemoteConversation>;
    async fn new_dm(&self, inbox_id: &InboxId) -> ProtocolResult<RemoteConversation>;
    async fn new_dm_with_identifier(
        &self,
        identifier: &Identifier,
    ) -> ProtocolResult<RemoteConversation>;
    async fn stream_conversations(&self) -> ProtocolResult<Subscription<RemoteConversation>>;

    async fn sync_conversation(&self, conversation_id: &ConversationId) -> ProtocolResult<()>;
    async fn conversation_messages(
        &self,
        conversation_id: &ConversationId,
        options: &MessageListOptions,
    ) -> ProtocolResult<Vec<MessageRecord>>;
    async fn stream_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> ProtocolResult<Subscription<MessageRecord>>;
}

#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn create(
        &self,
        signer: Arc<dyn Signer>,
        options: ClientOptions,
    ) -> ProtocolResult<Arc<dyn ProtocolClient>>;
}

pub struct MissingClientFactory;

#[async_trait]
impl ClientFactory for MissingClientFactory {
    async fn create(
        &self,
        _signer: Arc<dyn Signer>,
        _options: ClientOptions,
    ) -> ProtocolResult<Arc<dyn ProtocolClient>> {
        Err(ProtocolError::Unreachable(
            "protocol client factory is unavailable".to_string(),
        ))
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
