use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::api::models::{ChatSession, ChatSessionCreate};
use crate::api::ChatBackend;
use crate::chat::conversation::Conversation;
use crate::chat::ChatError;

/// The set of chat sessions opened in this client and the one in view.
/// Moving focus never touches streams running in other sessions.
pub struct ChatWorkspace {
    backend: Arc<dyn ChatBackend>,
    conversations: HashMap<String, Conversation>,
    active: Option<String>,
    event_buffer: usize,
}

impl ChatWorkspace {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self::with_event_buffer(backend, 256)
    }

    pub fn with_event_buffer(backend: Arc<dyn ChatBackend>, event_buffer: usize) -> Self {
        Self {
            backend,
            conversations: HashMap::new(),
            active: None,
            event_buffer,
        }
    }

    pub async fn list_sessions(&self) -> Result<Vec<ChatSession>, ChatError> {
        Ok(self.backend.list_chat_sessions().await?)
    }

    pub async fn create_session(&mut self, name: Option<String>) -> Result<ChatSession, ChatError> {
        let session = self
            .backend
            .create_chat_session(&ChatSessionCreate { name })
            .await?;
        info!("Created chat {}", session.id);
        Ok(session)
    }

    pub async fn rename_session(&self, chat_id: &str, name: &str) -> Result<(), ChatError> {
        let req = ChatSessionCreate {
            name: Some(name.to_string()),
        };
        Ok(self.backend.update_chat_session(chat_id, &req).await?)
    }

    /// Opens (or returns the already open) conversation and puts it in view.
    pub async fn open(&mut self, chat_id: &str) -> Result<Conversation, ChatError> {
        if !self.conversations.contains_key(chat_id) {
            let conversation =
                Conversation::open_with_buffer(self.backend.clone(), chat_id, self.event_buffer).await?;
            self.conversations.insert(chat_id.to_string(), conversation);
        }
        self.active = Some(chat_id.to_string());
        self.get(chat_id)
            .ok_or_else(|| ChatError::InvalidState(format!("chat {} failed to open", chat_id)))
    }

    /// Changes which open conversation is in view.
    pub fn switch_to(&mut self, chat_id: &str) -> Result<Conversation, ChatError> {
        let conversation = self
            .get(chat_id)
            .ok_or_else(|| ChatError::InvalidState(format!("chat {} is not open", chat_id)))?;
        self.active = Some(chat_id.to_string());
        Ok(conversation)
    }

    pub fn get(&self, chat_id: &str) -> Option<Conversation> {
        self.conversations.get(chat_id).cloned()
    }

    pub fn active(&self) -> Option<Conversation> {
        self.active.as_deref().and_then(|id| self.get(id))
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn open_ids(&self) -> Vec<String> {
        self.conversations.keys().cloned().collect()
    }

    /// Deletes a chat session. A stream still running in it is aborted
    /// first, since deleting is an explicit user action.
    pub async fn delete_session(&mut self, chat_id: &str) -> Result<(), ChatError> {
        if let Some(conversation) = self.conversations.get(chat_id) {
            if conversation.stream_state().await.message_id().is_some() {
                if let Err(e) = conversation.abort().await {
                    warn!("Could not abort stream in chat {} before deleting: {}", chat_id, e);
                }
            }
        }

        self.backend.delete_chat_session(chat_id).await?;
        self.conversations.remove(chat_id);
        if self.active.as_deref() == Some(chat_id) {
            self.active = None;
        }
        info!("Deleted chat {}", chat_id);
        Ok(())
    }
}
