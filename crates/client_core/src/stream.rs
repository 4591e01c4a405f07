use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use protocol_client::Subscription;
use shared::error::ProtocolError;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

/// Receives the items of one push subscription, in delivery order.
#[async_trait]
pub(crate) trait StreamSink<T: Send + 'static>: Send + Sync + 'static {
    async fn accept(&self, item: T);

    /// Called when the source ends on its own, with the terminal error if
    /// there was one. Not called after [`StreamHandle::stop`].
    async fn finished(&self, error: Option<ProtocolError>);
}

/// Stop capability for one live subscription. Clones share the same consumer
/// task; `stop` is idempotent across all of them.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamTask>,
}

struct StreamTask {
    scope: String,
    task: StdMutex<Option<JoinHandle<()>>>,
    /// Flips to true once the consumer future has been dropped.
    ended: Arc<watch::Sender<bool>>,
}

/// Lives inside the consumer future, so it drops on completion and on abort.
struct EndedGuard(Arc<watch::Sender<bool>>);

impl Drop for EndedGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl StreamTask {
    fn take(&self) -> Option<JoinHandle<()>> {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for StreamTask {
    fn drop(&mut self) {
        if let Some(task) = self.take() {
            task.abort();
        }
    }
}

impl StreamHandle {
    pub(crate) fn spawn<T, S>(
        scope: impl Into<String>,
        subscription: Subscription<T>,
        sink: Arc<S>,
    ) -> Self
    where
        T: Send + 'static,
        S: StreamSink<T>,
    {
        let scope = scope.into();
        let task_scope = scope.clone();
        let (ended, _) = watch::channel(false);
        let ended = Arc::new(ended);
        let guard = EndedGuard(Arc::clone(&ended));
        let task = tokio::spawn(async move {
            let _ended = guard;
            let mut events = subscription.into_stream();
            let mut terminal = None;
            while let Some(event) = events.next().await {
                match event {
                    Ok(item) => sink.accept(item).await,
                    Err(err) => {
                        warn!(scope = %task_scope, "stream: subscription terminated: {err}");
                        terminal = Some(err);
                        break;
                    }
                }
            }
            if terminal.is_none() {
                debug!(scope = %task_scope, "stream: source closed");
            }
            sink.finished(terminal).await;
        });
        info!(scope = %scope, "stream: opened");

        Self {
            inner: Arc::new(StreamTask {
                scope,
                task: StdMutex::new(Some(task)),
                ended,
            }),
        }
    }

    /// Cancels the subscription and waits for the consumer task to wind down,
    /// so no item is applied after this returns. Concurrent callers on
    /// clones all wait for the same task.
    pub async fn stop(&self) {
        let mut ended = self.inner.ended.subscribe();
        if let Some(task) = self.inner.take() {
            task.abort();
            let _ = task.await;
            info!(scope = %self.inner.scope, "stream: stopped");
        }
        let _ = ended.wait_for(|ended| *ended).await;
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("scope", &self.inner.scope)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/stream_tests.rs"]
mod tests;
