pub mod auth;
pub mod client;
pub mod models;
pub mod stream;

pub use auth::AuthSession;
pub use client::ApiClient;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

use models::{
    ChatSession, ChatSessionCreate, ChatSessionWithMessages, Message, MessageCreate, MessageStream,
    ModelInfo, ProviderInfo, StreamEvent,
};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Network Error: {0}")]
    Network(String),
    #[error("Authentication Error {status}: {detail}")]
    Auth { status: u16, detail: String },
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Server Error {status}: {detail}")]
    Server { status: u16, detail: String },
    #[error("API Error {status}: {detail}")]
    Api { status: u16, detail: String },
    #[error("Decode Error: {0}")]
    Decode(String),
}

impl ApiError {
    /// Maps a non-2xx status and its `detail` message onto the taxonomy.
    pub fn from_status(status: u16, detail: String) -> Self {
        match status {
            401 | 403 => ApiError::Auth { status, detail },
            404 => ApiError::NotFound(detail),
            409 => ApiError::Conflict(detail),
            500..=599 => ApiError::Server { status, detail },
            _ => ApiError::Api { status, detail },
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Auth { status, .. }
            | ApiError::Server { status, .. }
            | ApiError::Api { status, .. } => Some(*status),
            ApiError::NotFound(_) => Some(404),
            ApiError::Conflict(_) => Some(409),
            ApiError::Network(_) | ApiError::Decode(_) => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ApiError::Auth { .. })
    }

    /// Failures where the request may never have reached the backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Network(_))
    }
}

/// Ordered, finite sequence of stream events for one assistant message.
/// Ends after a `Done`/`Error` event, a transport error, or a clean close.
pub type FragmentStream = BoxStream<'static, Result<StreamEvent, ApiError>>;

/// The part of the backend surface the conversation core depends on.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn list_chat_sessions(&self) -> Result<Vec<ChatSession>, ApiError>;

    async fn create_chat_session(&self, req: &ChatSessionCreate) -> Result<ChatSession, ApiError>;

    async fn update_chat_session(&self, chat_id: &str, req: &ChatSessionCreate) -> Result<(), ApiError>;

    async fn delete_chat_session(&self, chat_id: &str) -> Result<(), ApiError>;

    async fn get_chat_session(&self, chat_id: &str) -> Result<ChatSessionWithMessages, ApiError>;

    async fn create_message(&self, chat_id: &str, req: &MessageCreate) -> Result<Message, ApiError>;

    async fn edit_message(&self, message_id: &str, req: &MessageCreate) -> Result<(), ApiError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError>;

    /// Asks the backend to produce the assistant message. `Ok` means the
    /// request was accepted; content arrives through the returned stream.
    async fn continue_stream(
        &self,
        chat_id: &str,
        message_id: &str,
        req: &MessageStream,
    ) -> Result<FragmentStream, ApiError>;

    async fn abort_stream(&self, message_id: &str) -> Result<(), ApiError>;

    async fn list_providers(&self) -> Result<Vec<ProviderInfo>, ApiError>;

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError>;
}
