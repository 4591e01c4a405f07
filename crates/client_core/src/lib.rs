//! Keeps a locally cached, live view of a user's conversations and of the
//! currently open conversation's messages on top of a [`ProtocolClient`].
//!
//! [`ProtocolClient`]: protocol_client::ProtocolClient

pub mod directory;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod session;
pub mod status;
pub mod stream;

pub use directory::ConversationDirectory;
pub use error::{CreationError, SyncError};
pub use events::{DirectoryEvent, SessionEvent};
pub use lifecycle::{ClientHandle, ClientLifecycle, InitializeOptions};
pub use session::{ConversationSession, SessionOutcome, SessionPhase};
pub use status::{StatusDepth, StatusFlags};
pub use stream::StreamHandle;

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
