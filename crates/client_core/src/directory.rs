use std::{collections::HashSet, sync::Arc};

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, Identifier, InboxId, MessageId},
    error::ProtocolError,
    protocol::{
        ConversationRecord, CreateGroupOptions, ListConversationsOptions, MessageRecord,
        RemoteConversation,
    },
};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    events::{DirectoryEvent, EVENT_BUFFER},
    lifecycle::ClientHandle,
    status::{BusyKind, StatusDepth, StatusFlags, StatusTracker},
    stream::{StreamHandle, StreamSink},
};

const CONVERSATION_STREAM_SCOPE: &str = "conversations";

struct DirectoryShared {
    conversations: RwLock<Vec<ConversationRecord>>,
    status: StatusTracker,
    events: broadcast::Sender<DirectoryEvent>,
}

impl DirectoryShared {
    fn emit(&self, event: DirectoryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Cached, ordered list of the user's conversations.
///
/// Without a client every operation returns an empty result and
/// [`status`](Self::status) reports [`StatusFlags::INERT`].
pub struct ConversationDirectory {
    client: Option<ClientHandle>,
    shared: Arc<DirectoryShared>,
    stream: Mutex<Option<StreamHandle>>,
}

impl ConversationDirectory {
    pub fn new(client: Option<ClientHandle>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let status = if client.is_some() {
            StatusTracker::new()
        } else {
            StatusTracker::inert()
        };
        Self {
            client,
            shared: Arc::new(DirectoryShared {
                conversations: RwLock::new(Vec::new()),
                status,
                events,
            }),
            stream: Mutex::new(None),
        }
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub async fn conversations(&self) -> Vec<ConversationRecord> {
        self.shared.conversations.read().await.clone()
    }

    pub fn status(&self) -> StatusFlags {
        self.shared.status.flags()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusDepth> {
        self.shared.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.shared.events.subscribe()
    }

    /// Fetches the authoritative list and replaces the cache with it.
    pub async fn list(
        &self,
        options: &ListConversationsOptions,
        sync_first: bool,
    ) -> Result<Vec<ConversationRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(Vec::new());
        };
        if sync_first {
            self.sync().await?;
        }

        let _busy = self.shared.status.acquire(BusyKind::Loading);
        let remote = client
            .list_conversations(options)
            .await
            .map_err(SyncError::List)?;
        let records = into_records(remote);

        *self.shared.conversations.write().await = records.clone();
        info!(count = records.len(), "directory: conversation list replaced");
        self.shared.emit(DirectoryEvent::ConversationsReplaced {
            count: records.len(),
        });
        Ok(records)
    }

    /// Pulls conversation metadata only.
    pub async fn sync(&self) -> Result<(), SyncError> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let _busy = self.shared.status.acquire(BusyKind::Syncing);
        client.sync_conversations().await.map_err(SyncError::Sync)?;
        debug!("directory: conversations synced");
        Ok(())
    }

    /// Pulls metadata and message history for every conversation.
    pub async fn sync_all(&self) -> Result<(), SyncError> {
        let Some(client) = &self.client else {
            return Ok(());
        };
        let _busy = self.shared.status.acquire(BusyKind::Syncing);
        client
            .sync_all_conversations()
            .await
            .map_err(SyncError::Sync)?;
        debug!("directory: all conversations synced");
        Ok(())
    }

    /// Opens the new-conversation stream. Arrivals go to the head of the
    /// cached list unless a record with the same id is already there.
    ///
    /// A stream this directory opened earlier is stopped first.
    pub async fn stream_new_conversations(&self) -> Result<Option<StreamHandle>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };

        let mut slot = self.stream.lock().await;
        if let Some(prior) = slot.take() {
            if prior.is_active() {
                warn!("directory: conversation stream reopened without stop, stopping prior one");
            }
            prior.stop().await;
        }

        let subscription =
            client
                .stream_conversations()
                .await
                .map_err(|source| SyncError::StreamOpen {
                    scope: CONVERSATION_STREAM_SCOPE.to_string(),
                    source,
                })?;
        let sink = Arc::new(ConversationSink {
            shared: Arc::clone(&self.shared),
        });
        let handle = StreamHandle::spawn(CONVERSATION_STREAM_SCOPE, subscription, sink);
        *slot = Some(handle.clone());
        Ok(Some(handle))
    }

    pub async fn is_streaming(&self) -> bool {
        self.stream
            .lock()
            .await
            .as_ref()
            .is_some_and(StreamHandle::is_active)
    }

    /// Stops the conversation stream, if any. The cached list is kept.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.stream.lock().await.take() {
            handle.stop().await;
        }
    }

    pub async fn get_conversation_by_id(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        let found = client
            .get_conversation_by_id(conversation_id)
            .await
            .map_err(SyncError::Lookup)?;
        match found.map(ConversationRecord::try_from) {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(reason)) => {
                warn!(conversation_id = %conversation_id, "directory: lookup found unsupported conversation: {reason}");
                Ok(None)
            }
            None => {
                debug!(conversation_id = %conversation_id, "directory: conversation not found");
                Ok(None)
            }
        }
    }

    pub async fn get_message_by_id(
        &self,
        message_id: &MessageId,
    ) -> Result<Option<MessageRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        client
            .get_message_by_id(message_id)
            .await
            .map_err(SyncError::Lookup)
    }

    // Created conversations are returned, not cached. A later `list` or the
    // conversation stream picks them up.

    pub async fn new_group(
        &self,
        inbox_ids: &[InboxId],
        options: &CreateGroupOptions,
    ) -> Result<Option<ConversationRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        let created = client.new_group(inbox_ids, options).await;
        created_record(created)
    }

    pub async fn new_group_with_identifiers(
        &self,
        identifiers: &[Identifier],
        options: &CreateGroupOptions,
    ) -> Result<Option<ConversationRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        let created = client.new_group_with_identifiers(identifiers, options).await;
        created_record(created)
    }

    pub async fn new_dm(&self, inbox_id: &InboxId) -> Result<Option<ConversationRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        let created = client.new_dm(inbox_id).await;
        created_record(created)
    }

    pub async fn new_dm_with_identifier(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<ConversationRecord>, SyncError> {
        let Some(client) = &self.client else {
            return Ok(None);
        };
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        let created = client.new_dm_with_identifier(identifier).await;
        created_record(created)
    }
}

fn created_record(
    created: Result<RemoteConversation, ProtocolError>,
) -> Result<Option<ConversationRecord>, SyncError> {
    let remote = created.map_err(SyncError::Create)?;
    let record = ConversationRecord::try_from(remote)?;
    info!(conversation_id = %record.id, group = record.is_group(), "directory: conversation created");
    Ok(Some(record))
}

/// Keeps fetch order, drops unsupported kinds and repeated ids.
fn into_records(remote: Vec<RemoteConversation>) -> Vec<ConversationRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::with_capacity(remote.len());
    for conversation in remote {
        match ConversationRecord::try_from(conversation) {
            Ok(record) => {
                if seen.insert(record.id.clone()) {
                    records.push(record);
                } else {
                    debug!(conversation_id = %record.id, "directory: duplicate id in list result");
                }
            }
            Err(reason) => warn!("directory: skipping listed conversation: {reason}"),
        }
    }
    records
}

struct ConversationSink {
    shared: Arc<DirectoryShared>,
}

#[async_trait]
impl StreamSink<RemoteConversation> for ConversationSink {
    async fn accept(&self, remote: RemoteConversation) {
        let record = match ConversationRecord::try_from(remote) {
            Ok(record) => record,
            Err(reason) => {
                warn!("directory: ignoring streamed conversation: {reason}");
                return;
            }
        };

        // Check and insert under one write lock.
        {
            let mut conversations = self.shared.conversations.write().await;
            if conversations.iter().any(|existing| existing.id == record.id) {
                debug!(conversation_id = %record.id, "directory: streamed conversation already cached");
                return;
            }
            conversations.insert(0, record.clone());
        }
        debug!(conversation_id = %record.id, "directory: streamed conversation added");
        self.shared.emit(DirectoryEvent::ConversationAdded(record));
    }

    async fn finished(&self, error: Option<ProtocolError>) {
        self.shared.emit(DirectoryEvent::StreamEnded { error });
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
