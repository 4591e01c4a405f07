use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use shared::{
    domain::ConversationId,
    error::ProtocolError,
    protocol::{ConversationRecord, MessageListOptions, MessageRecord},
};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    events::{SessionEvent, EVENT_BUFFER},
    lifecycle::ClientHandle,
    status::{BusyKind, StatusDepth, StatusFlags, StatusTracker},
    stream::{StreamHandle, StreamSink},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Idle,
    StoppingPriorStream,
    Loading,
    Streaming,
}

/// How a switch request ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// History was replaced and the message stream is live.
    Streaming,
    /// A later open, resync or close took over; this request's results were
    /// discarded.
    Superseded,
    /// Nothing is open.
    NoTarget,
    /// The session has no client.
    Inert,
}

#[derive(Default)]
struct SessionState {
    // Bumped by every open, resync, reload and close. Work started under an
    // older value must not touch the state.
    epoch: u64,
    phase: SessionPhase,
    target: Option<ConversationRecord>,
    title: Option<String>,
    messages: Vec<MessageRecord>,
}

struct SessionShared {
    state: Mutex<SessionState>,
    status: StatusTracker,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn is_current(&self, epoch: u64) -> bool {
        self.state.lock().await.epoch == epoch
    }

    async fn set_phase(&self, epoch: u64, phase: SessionPhase) {
        let mut state = self.state.lock().await;
        if state.epoch == epoch {
            state.phase = phase;
        }
    }
}

/// Controller for the currently open conversation: its message history and
/// the single live message stream.
pub struct ConversationSession {
    client: Option<ClientHandle>,
    shared: Arc<SessionShared>,
    stream: Mutex<Option<StreamHandle>>,
}

impl ConversationSession {
    pub fn new(client: Option<ClientHandle>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let status = if client.is_some() {
            StatusTracker::new()
        } else {
            StatusTracker::inert()
        };
        Self {
            client,
            shared: Arc::new(SessionShared {
                state: Mutex::new(SessionState::default()),
                status,
                events,
            }),
            stream: Mutex::new(None),
        }
    }

    pub async fn target(&self) -> Option<ConversationRecord> {
        self.shared.state.lock().await.target.clone()
    }

    pub async fn title(&self) -> Option<String> {
        self.shared.state.lock().await.title.clone()
    }

    pub async fn messages(&self) -> Vec<MessageRecord> {
        self.shared.state.lock().await.messages.clone()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.shared.state.lock().await.phase
    }

    pub fn status(&self) -> StatusFlags {
        self.shared.status.flags()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StatusDepth> {
        self.shared.status.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events.subscribe()
    }

    /// Switches to `conversation`: stops the live stream, replaces the
    /// history with a forced refresh, then opens a stream for the new target.
    pub async fn open(&self, conversation: ConversationRecord) -> Result<SessionOutcome, SyncError> {
        self.switch(conversation, false, MessageListOptions::default())
            .await
    }

    /// Re-runs the open sequence for the current target and refreshes its
    /// metadata and title.
    pub async fn resync(&self) -> Result<SessionOutcome, SyncError> {
        let Some(target) = self.target().await else {
            return Ok(SessionOutcome::NoTarget);
        };
        self.switch(target, true, MessageListOptions::default())
            .await
    }

    /// Like [`resync`](Self::resync) without the metadata refresh, loading
    /// history with `options`.
    pub async fn reload(&self, options: MessageListOptions) -> Result<SessionOutcome, SyncError> {
        let Some(target) = self.target().await else {
            return Ok(SessionOutcome::NoTarget);
        };
        self.switch(target, false, options).await
    }

    /// Stops the stream and forgets the target. Safe to call at any time.
    pub async fn close(&self) {
        {
            let mut state = self.shared.state.lock().await;
            state.epoch += 1;
            state.phase = SessionPhase::Idle;
            state.target = None;
            state.title = None;
            state.messages.clear();
        }
        self.stop_stream().await;
        debug!("session: closed");
    }

    async fn stop_stream(&self) {
        if let Some(handle) = self.stream.lock().await.take() {
            handle.stop().await;
        }
    }

    async fn switch(
        &self,
        target: ConversationRecord,
        refresh_metadata: bool,
        options: MessageListOptions,
    ) -> Result<SessionOutcome, SyncError> {
        let Some(client) = self.client.clone() else {
            return Ok(SessionOutcome::Inert);
        };

        let epoch = {
            let mut state = self.shared.state.lock().await;
            state.epoch += 1;
            let changed = state.target.as_ref().map(|current| &current.id) != Some(&target.id);
            if changed {
                state.messages.clear();
                self.shared.emit(SessionEvent::TargetChanged {
                    conversation_id: target.id.clone(),
                });
            }
            let title = target.display_name();
            if state.title.as_deref() != Some(title.as_str()) {
                self.shared.emit(SessionEvent::TitleChanged(title.clone()));
            }
            state.title = Some(title);
            state.target = Some(target.clone());
            state.phase = SessionPhase::StoppingPriorStream;
            state.epoch
        };
        info!(conversation_id = %target.id, refresh_metadata, "session: switching target");

        let result = self
            .run_switch(&client, epoch, target, refresh_metadata, &options)
            .await;
        if result.is_err() {
            self.shared.set_phase(epoch, SessionPhase::Idle).await;
        }
        result
    }

    async fn run_switch(
        &self,
        client: &ClientHandle,
        epoch: u64,
        target: ConversationRecord,
        refresh_metadata: bool,
        options: &MessageListOptions,
    ) -> Result<SessionOutcome, SyncError> {
        self.stop_stream().await;
        if !self.shared.is_current(epoch).await {
            return Ok(SessionOutcome::Superseded);
        }
        self.shared.set_phase(epoch, SessionPhase::Loading).await;

        let target = if refresh_metadata {
            match self.refresh_metadata(client, epoch, &target).await? {
                Some(refreshed) => refreshed,
                None => return Ok(SessionOutcome::Superseded),
            }
        } else {
            target
        };

        let history = self.fetch_history(client, &target.id, options).await?;
        {
            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch {
                debug!(conversation_id = %target.id, "session: discarding superseded history");
                return Ok(SessionOutcome::Superseded);
            }
            let count = history.len();
            state.messages = history;
            info!(conversation_id = %target.id, count, "session: messages replaced");
            self.shared.emit(SessionEvent::MessagesReplaced {
                conversation_id: target.id.clone(),
                count,
            });
        }

        let scope = format!("messages:{}", target.id);
        let subscription = client
            .stream_messages(&target.id)
            .await
            .map_err(|source| SyncError::StreamOpen {
                scope: scope.clone(),
                source,
            })?;

        // The slot lock is held across the epoch check so a concurrent switch
        // either sees no stream yet or stops this one.
        let mut slot = self.stream.lock().await;
        {
            let mut state = self.shared.state.lock().await;
            if state.epoch != epoch {
                debug!(conversation_id = %target.id, "session: dropping superseded stream");
                return Ok(SessionOutcome::Superseded);
            }
            state.phase = SessionPhase::Streaming;
        }
        if let Some(prior) = slot.take() {
            warn!(scope = prior.scope(), "session: stream slot was occupied, stopping it");
            prior.stop().await;
        }
        let sink = Arc::new(MessageSink {
            shared: Arc::clone(&self.shared),
            epoch,
            conversation_id: target.id.clone(),
        });
        *slot = Some(StreamHandle::spawn(scope, subscription, sink));
        Ok(SessionOutcome::Streaming)
    }

    /// Returns `None` if the request was superseded meanwhile.
    async fn refresh_metadata(
        &self,
        client: &ClientHandle,
        epoch: u64,
        target: &ConversationRecord,
    ) -> Result<Option<ConversationRecord>, SyncError> {
        let found = {
            let _busy = self.shared.status.acquire(BusyKind::Syncing);
            client
                .get_conversation_by_id(&target.id)
                .await
                .map_err(SyncError::Lookup)?
        };
        let refreshed = match found {
            Some(remote) => ConversationRecord::try_from(remote)?,
            None => {
                debug!(conversation_id = %target.id, "session: conversation metadata not found, keeping cached");
                target.clone()
            }
        };

        let mut state = self.shared.state.lock().await;
        if state.epoch != epoch {
            return Ok(None);
        }
        let title = refreshed.display_name();
        if state.title.as_deref() != Some(title.as_str()) {
            self.shared.emit(SessionEvent::TitleChanged(title.clone()));
        }
        state.title = Some(title);
        state.target = Some(refreshed.clone());
        Ok(Some(refreshed))
    }

    async fn fetch_history(
        &self,
        client: &ClientHandle,
        conversation_id: &ConversationId,
        options: &MessageListOptions,
    ) -> Result<Vec<MessageRecord>, SyncError> {
        {
            let _busy = self.shared.status.acquire(BusyKind::Syncing);
            client
                .sync_conversation(conversation_id)
                .await
                .map_err(SyncError::Sync)?;
        }
        let _busy = self.shared.status.acquire(BusyKind::Loading);
        client
            .conversation_messages(conversation_id, options)
            .await
            .map_err(|source| SyncError::Load {
                conversation_id: conversation_id.clone(),
                source,
            })
    }
}

struct MessageSink {
    shared: Arc<SessionShared>,
    epoch: u64,
    conversation_id: ConversationId,
}

#[async_trait]
impl StreamSink<MessageRecord> for MessageSink {
    async fn accept(&self, message: MessageRecord) {
        let mut state = self.shared.state.lock().await;
        if state.epoch != self.epoch || message.conversation_id != self.conversation_id {
            debug!(
                conversation_id = %message.conversation_id,
                message_id = %message.id,
                "session: ignoring late message"
            );
            return;
        }
        if state.messages.iter().any(|existing| existing.id == message.id) {
            debug!(message_id = %message.id, "session: message already loaded");
            return;
        }
        state.messages.push(message.clone());
        self.shared.emit(SessionEvent::MessageAppended(message));
    }

    async fn finished(&self, error: Option<ProtocolError>) {
        {
            let mut state = self.shared.state.lock().await;
            if state.epoch != self.epoch {
                return;
            }
            state.phase = SessionPhase::Idle;
        }
        self.shared.emit(SessionEvent::StreamEnded {
            conversation_id: self.conversation_id.clone(),
            error,
        });
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
