use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::models::{Message, MessageContent, MessageCreate, Role};
use crate::api::ChatBackend;
use crate::chat::reconcile::{reconcile, ReconcileReport};
use crate::chat::selection::{ModelSelection, SelectionState};
use crate::chat::store::MessageStore;
use crate::chat::stream::{claim, AbortOutcome, StreamManager, StreamState, StreamTask};
use crate::chat::{ChatError, Session, ThreadEvent};

const DEFAULT_EVENT_BUFFER: usize = 256;

/// One open chat session: its message store, its stream slot and the
/// backend they talk to. Independent of every other open session.
#[derive(Clone)]
pub struct Conversation {
    backend: Arc<dyn ChatBackend>,
    session: Arc<Session>,
    streams: StreamManager,
}

impl Conversation {
    pub async fn open(backend: Arc<dyn ChatBackend>, chat_id: &str) -> Result<Self, ChatError> {
        Self::open_with_buffer(backend, chat_id, DEFAULT_EVENT_BUFFER).await
    }

    pub async fn open_with_buffer(
        backend: Arc<dyn ChatBackend>,
        chat_id: &str,
        event_buffer: usize,
    ) -> Result<Self, ChatError> {
        let mut store = MessageStore::new();
        let messages = store.load(backend.as_ref(), chat_id).await?;
        info!("Opened chat {} with {} messages", chat_id, messages.len());

        let session = Arc::new(Session::new(chat_id.to_string(), store, event_buffer));
        let streams = StreamManager::new(backend.clone(), session.clone());
        Ok(Self {
            backend,
            session,
            streams,
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.session.chat_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThreadEvent> {
        self.session.events.subscribe()
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Ordered snapshot of the thread.
    pub async fn thread(&self) -> Vec<Message> {
        let state = self.session.state.lock().await;
        state.store.ordered().into_iter().cloned().collect()
    }

    pub async fn message(&self, message_id: &str) -> Option<Message> {
        self.session.state.lock().await.store.get(message_id).cloned()
    }

    pub async fn failure(&self, message_id: &str) -> Option<String> {
        let state = self.session.state.lock().await;
        state.store.failure(message_id).map(str::to_string)
    }

    pub async fn stream_state(&self) -> StreamState {
        self.streams.state().await
    }

    /// Sends a user message and starts streaming the assistant reply.
    pub async fn send(&self, text: &str, selection: &SelectionState) -> Result<StreamTask, ChatError> {
        let choice = selection.validated()?;
        self.reserve().await?;
        let result = self.send_inner(text, &choice).await;
        self.session.state.lock().await.sending = false;
        result
    }

    /// Streams a new assistant reply under `parent_id`, as a sibling of any
    /// earlier replies.
    pub async fn regenerate(&self, parent_id: &str, selection: &SelectionState) -> Result<StreamTask, ChatError> {
        let choice = selection.validated()?;
        self.reserve().await?;
        let result = self.regenerate_inner(parent_id, &choice).await;
        self.session.state.lock().await.sending = false;
        result
    }

    /// Rejects a second send while a send or a stream is in flight, before
    /// anything is created.
    async fn reserve(&self) -> Result<(), ChatError> {
        let mut state = self.session.state.lock().await;
        if let Some(active) = state.machine.live_message() {
            return Err(ChatError::Conflict(active.to_string()));
        }
        if state.sending {
            return Err(ChatError::Conflict("a message send".to_string()));
        }
        state.sending = true;
        Ok(())
    }

    async fn send_inner(&self, text: &str, choice: &ModelSelection) -> Result<StreamTask, ChatError> {
        let chat_id = self.chat_id().to_string();
        let local_id = format!("local-{}", Uuid::new_v4());

        let parent = {
            let mut state = self.session.state.lock().await;
            let parent = state.store.tail_id();
            state.store.append(Message {
                id: local_id.clone(),
                chat_session_id: chat_id.clone(),
                role: Role::User,
                content: MessageContent::from(text),
                parent_message_id: parent.clone(),
                timestamp: Utc::now(),
                is_partial: false,
                model: None,
                provider: None,
            });
            state.pending.insert(local_id.clone());
            parent
        };
        self.session.notify(ThreadEvent::MessageAdded {
            message_id: local_id.clone(),
        });

        let request = MessageCreate {
            role: Role::User,
            content: MessageContent::from(text),
            parent_message_id: parent,
        };
        let user_message = match self.backend.create_message(&chat_id, &request).await {
            Ok(message) => message,
            Err(e) => {
                let mut state = self.session.state.lock().await;
                state.store.remove(&local_id);
                state.pending.remove(&local_id);
                return Err(e.into());
            }
        };

        {
            let mut state = self.session.state.lock().await;
            state.store.remove(&local_id);
            state.pending.remove(&local_id);
            state.store.append(user_message.clone());
        }
        self.session.notify(ThreadEvent::MessageAdded {
            message_id: user_message.id.clone(),
        });

        self.reply_to(&user_message.id, choice).await
    }

    async fn regenerate_inner(&self, parent_id: &str, choice: &ModelSelection) -> Result<StreamTask, ChatError> {
        if !self.session.state.lock().await.store.contains(parent_id) {
            return Err(ChatError::NotFound(parent_id.to_string()));
        }
        self.reply_to(parent_id, choice).await
    }

    async fn reply_to(&self, parent_id: &str, choice: &ModelSelection) -> Result<StreamTask, ChatError> {
        let request = MessageCreate {
            role: Role::Assistant,
            content: MessageContent::empty(),
            parent_message_id: Some(parent_id.to_string()),
        };
        let mut assistant = self.backend.create_message(self.chat_id(), &request).await?;
        assistant.is_partial = true;
        assistant.model.get_or_insert_with(|| choice.model.clone());
        assistant.provider.get_or_insert_with(|| choice.provider.clone());
        let assistant_id = assistant.id.clone();

        // Insert and claim the slot in one critical section, so a refresh
        // cannot finalize the reply before the stream owns it.
        let claimed = {
            let mut state = self.session.state.lock().await;
            let state = &mut *state;
            if state.store.contains(&assistant_id) {
                // A refresh already pulled in the server copy.
                state.store.replace(assistant);
            } else {
                state.store.append(assistant);
            }
            let claimed = claim(state, &assistant_id);
            if claimed.is_err() {
                state.store.finalize(&assistant_id, None);
            }
            claimed
        };
        self.session.notify(ThreadEvent::MessageAdded {
            message_id: assistant_id.clone(),
        });

        self.streams
            .launch(&assistant_id, claimed?, &choice.model, &choice.provider, Some(parent_id))
            .await
    }

    /// Aborts the stream that is currently live, if it is streaming.
    pub async fn abort(&self) -> Result<AbortOutcome, ChatError> {
        let live = self.session.state.lock().await.machine.live_message().map(str::to_string);
        match live {
            Some(message_id) => self.streams.abort(&message_id).await,
            None => Err(ChatError::InvalidState("no stream is active".to_string())),
        }
    }

    /// Reloads the thread from the backend and merges it into local state.
    pub async fn refresh(&self) -> Result<ReconcileReport, ChatError> {
        let thread = self.backend.get_chat_session(self.chat_id()).await?;
        let report = {
            let mut state = self.session.state.lock().await;
            let state = &mut *state;
            let live = state.machine.live_message().map(str::to_string);
            reconcile(&mut state.store, thread.messages, live.as_deref(), &state.pending)
        };
        self.session.notify(ThreadEvent::Reconciled(report.clone()));
        Ok(report)
    }

    pub async fn edit_message(&self, message_id: &str, text: &str) -> Result<Message, ChatError> {
        let role = {
            let state = self.session.state.lock().await;
            let message = state
                .store
                .get(message_id)
                .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
            if message.is_partial {
                return Err(ChatError::InvalidState(format!(
                    "message {} is still receiving content",
                    message_id
                )));
            }
            message.role
        };

        let request = MessageCreate {
            role,
            content: MessageContent::from(text),
            parent_message_id: None,
        };
        self.backend.edit_message(message_id, &request).await?;

        let mut state = self.session.state.lock().await;
        let mut updated = state
            .store
            .get(message_id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
        updated.content = MessageContent::from(text);
        state.store.replace(updated.clone());
        Ok(updated)
    }

    /// Deletes one message on the backend and locally. Replies to it stay
    /// and render as orphans.
    pub async fn delete_message(&self, message_id: &str) -> Result<(), ChatError> {
        {
            let state = self.session.state.lock().await;
            if state.machine.live_message() == Some(message_id) {
                return Err(ChatError::InvalidState(format!(
                    "message {} is streaming; abort it first",
                    message_id
                )));
            }
            if !state.store.contains(message_id) {
                return Err(ChatError::NotFound(message_id.to_string()));
            }
        }

        self.backend.delete_message(message_id).await?;

        if self.session.state.lock().await.store.remove(message_id).is_none() {
            warn!("Message {} vanished before local removal", message_id);
        }
        Ok(())
    }
}
