pub mod conversation;
pub mod reconcile;
pub mod selection;
pub mod store;
pub mod stream;
pub mod transcript;
pub mod workspace;

pub use conversation::Conversation;
pub use reconcile::{reconcile, ReconcileReport};
pub use selection::{Catalog, ModelSelection, SelectionState};
pub use store::MessageStore;
pub use stream::{AbortOutcome, StreamManager, StreamMachine, StreamOutcome, StreamState, StreamTask};
pub use workspace::ChatWorkspace;

use std::collections::HashSet;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};

use crate::api::ApiError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("Busy: {0} is still in flight")]
    Conflict(String),
    #[error("Invalid selection: {provider}/{model} is not in the catalog")]
    InvalidSelection { provider: String, model: String },
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Message {0} not found")]
    NotFound(String),
    #[error("Stream failed for message {message_id}: {reason}")]
    StreamFailed { message_id: String, reason: String },
}

impl ChatError {
    /// Auth failures end the signed-in session; the view must sign out.
    pub fn requires_reauth(&self) -> bool {
        matches!(self, ChatError::Api(e) if e.is_auth())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChatError::Api(e) if e.is_transient())
    }
}

/// Notifications for views rendering a thread.
#[derive(Debug, Clone, PartialEq)]
pub enum ThreadEvent {
    MessageAdded { message_id: String },
    Delta { message_id: String, fragment: String },
    Finalized { message_id: String },
    Aborted { message_id: String },
    Failed { message_id: String, reason: String },
    Reconciled(ReconcileReport),
}

/// Everything one open chat session mutates, behind one lock.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub store: MessageStore,
    pub machine: StreamMachine,
    /// Ids of optimistic messages whose creation has not round-tripped yet.
    pub pending: HashSet<String>,
    pub sending: bool,
    pub pump: Option<tokio::task::AbortHandle>,
}

pub(crate) struct Session {
    pub chat_id: String,
    pub state: Mutex<SessionState>,
    pub events: broadcast::Sender<ThreadEvent>,
}

impl Session {
    pub fn new(chat_id: String, store: MessageStore, event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            chat_id,
            state: Mutex::new(SessionState {
                store,
                ..Default::default()
            }),
            events,
        }
    }

    pub fn notify(&self, event: ThreadEvent) {
        // No receivers is fine: nobody is rendering this session.
        let _ = self.events.send(event);
    }
}
