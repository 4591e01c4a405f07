use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use protocol_client::{ClientFactory, ClientOptions, Env, LogLevel, ProtocolClient, Signer};
use shared::protocol::ContentType;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::CreationError;

pub type ClientHandle = Arc<dyn ProtocolClient>;

#[derive(Clone)]
pub struct InitializeOptions {
    pub signer: Arc<dyn Signer>,
    pub env: Env,
    pub logging_level: Option<LogLevel>,
    pub db_encryption_key: Option<[u8; protocol_client::DB_ENCRYPTION_KEY_LEN]>,
}

impl InitializeOptions {
    pub fn new(signer: Arc<dyn Signer>) -> Self {
        Self {
            signer,
            env: Env::default(),
            logging_level: None,
            db_encryption_key: None,
        }
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions {
            env: self.env,
            logging_level: self.logging_level,
            db_encryption_key: self.db_encryption_key,
            codecs: ContentType::default_codecs(),
        }
    }
}

#[derive(Default)]
struct LifecycleState {
    client: Option<ClientHandle>,
    error: Option<CreationError>,
}

/// Owns the process's single protocol client handle.
pub struct ClientLifecycle {
    factory: Arc<dyn ClientFactory>,
    state: Mutex<LifecycleState>,
    initializing: AtomicBool,
}

struct InitializingReset<'a>(&'a AtomicBool);

impl Drop for InitializingReset<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ClientLifecycle {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            state: Mutex::new(LifecycleState::default()),
            initializing: AtomicBool::new(false),
        }
    }

    pub fn with_client(factory: Arc<dyn ClientFactory>, client: ClientHandle) -> Self {
        Self {
            factory,
            state: Mutex::new(LifecycleState {
                client: Some(client),
                error: None,
            }),
            initializing: AtomicBool::new(false),
        }
    }

    pub async fn client(&self) -> Option<ClientHandle> {
        self.state.lock().await.client.clone()
    }

    pub fn is_initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    pub async fn last_error(&self) -> Option<CreationError> {
        self.state.lock().await.error.clone()
    }

    /// Adopts an externally created handle, returning the one it replaces.
    /// The replaced handle is not closed.
    pub async fn set_client(&self, client: Option<ClientHandle>) -> Option<ClientHandle> {
        let mut state = self.state.lock().await;
        std::mem::replace(&mut state.client, client)
    }

    /// Returns the existing handle, or creates one. While another creation is
    /// in flight this returns `Ok(None)`; callers retry later.
    pub async fn initialize(
        &self,
        options: InitializeOptions,
    ) -> Result<Option<ClientHandle>, CreationError> {
        let identifier = options.signer.identifier();
        let _reset = {
            let mut state = self.state.lock().await;
            if let Some(client) = &state.client {
                info!(
                    inbox_id = %client.inbox_id(),
                    identifier = %client.account_identifier(),
                    "lifecycle: client already exists, reusing"
                );
                return Ok(Some(Arc::clone(client)));
            }
            if self
                .initializing
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                info!(identifier = %identifier, "lifecycle: already initializing, skipping");
                return Ok(None);
            }
            state.error = None;
            InitializingReset(&self.initializing)
        };

        info!(
            identifier = %identifier,
            env = %options.env,
            logging_level = ?options.logging_level,
            "lifecycle: creating client"
        );
        let created = self
            .factory
            .create(Arc::clone(&options.signer), options.client_options())
            .await;

        let mut state = self.state.lock().await;
        match created {
            Ok(client) => {
                info!(
                    inbox_id = %client.inbox_id(),
                    identifier = %client.account_identifier(),
                    "lifecycle: client created"
                );
                state.client = Some(Arc::clone(&client));
                Ok(Some(client))
            }
            Err(source) => {
                let err = CreationError {
                    identifier: identifier.to_string(),
                    source,
                };
                error!("lifecycle: failed to create client: {err}");
                state.client = None;
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Closes and forgets the current handle. Directories and sessions built
    /// on it should be shut down first.
    pub async fn disconnect(&self) {
        let client = self.state.lock().await.client.take();
        if let Some(client) = client {
            info!(
                inbox_id = %client.inbox_id(),
                identifier = %client.account_identifier(),
                "lifecycle: disconnecting client"
            );
            client.close().await;
        }
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
