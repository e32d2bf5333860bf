#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures_util::{stream, StreamExt};
use tokio::sync::{broadcast, Semaphore};
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use teehee::api::models::{
    ChatSession, ChatSessionCreate, ChatSessionWithMessages, Message, MessageContent, MessageCreate, MessageStream,
    ModelInfo, ProviderInfo, Role, StreamEvent,
};
use teehee::api::{ApiError, ChatBackend, FragmentStream};
use teehee::chat::ThreadEvent;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

pub fn message(id: &str, parent: Option<&str>, role: Role, content: &str) -> Message {
    Message {
        id: id.to_string(),
        chat_session_id: "chat-1".to_string(),
        role,
        content: MessageContent::from(content),
        parent_message_id: parent.map(str::to_string),
        timestamp: base_time(),
        is_partial: false,
        model: None,
        provider: None,
    }
}

pub fn partial(id: &str, parent: Option<&str>) -> Message {
    Message {
        is_partial: true,
        ..message(id, parent, Role::Assistant, "")
    }
}

pub fn text_of(message: &Message) -> String {
    message.content.as_text().into_owned()
}

type Feed = UnboundedSender<Result<StreamEvent, ApiError>>;

#[derive(Default)]
struct FakeState {
    sessions: Vec<ChatSession>,
    messages: Vec<Message>,
    next_id: u64,
    feeds: HashMap<String, Feed>,
    continue_requests: Vec<(String, MessageStream)>,
    abort_calls: Vec<String>,
    deleted_sessions: Vec<String>,
    fail_abort: bool,
    reject_stream: bool,
    fail_user_create: bool,
    /// Holds the response of creates for this role until a permit is added.
    held: Option<(Role, Arc<Semaphore>)>,
    models: Vec<ModelInfo>,
    providers: Vec<ProviderInfo>,
}

/// In-memory backend. Streams are fed by the test through `feed`.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
}

impl FakeBackend {
    pub fn with_chat(chat_id: &str) -> Self {
        let backend = FakeBackend::default();
        backend.state.lock().unwrap().sessions.push(ChatSession {
            id: chat_id.to_string(),
            name: Some("Test chat".to_string()),
            user_id: "user-1".to_string(),
            root_message_id: None,
            created_at: base_time(),
        });
        backend
    }

    pub fn seed(&self, messages: Vec<Message>) {
        self.state.lock().unwrap().messages.extend(messages);
    }

    pub fn set_catalog(&self, models: Vec<ModelInfo>, providers: Vec<ProviderInfo>) {
        let mut state = self.state.lock().unwrap();
        state.models = models;
        state.providers = providers;
    }

    pub fn fail_abort(&self) {
        self.state.lock().unwrap().fail_abort = true;
    }

    pub fn reject_streams(&self) {
        self.state.lock().unwrap().reject_stream = true;
    }

    pub fn fail_user_create(&self) {
        self.state.lock().unwrap().fail_user_create = true;
    }

    /// Commits creates of `role` server-side but withholds the response
    /// until `release` is called.
    pub fn hold_creates(&self, role: Role) {
        self.state.lock().unwrap().held = Some((role, Arc::new(Semaphore::new(0))));
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some((_, gate)) = state.held.take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    /// Pushes an event into the open stream of `message_id`.
    pub fn feed(&self, message_id: &str, event: Result<StreamEvent, ApiError>) {
        let state = self.state.lock().unwrap();
        let feed = state.feeds.get(message_id).expect("no open stream for message");
        let _ = feed.send(event);
    }

    pub fn chunk(&self, message_id: &str, text: &str) {
        self.feed(message_id, Ok(StreamEvent::Chunk(text.to_string())));
    }

    /// Ends the body without an explicit completion event.
    pub fn close(&self, message_id: &str) {
        self.state.lock().unwrap().feeds.remove(message_id);
    }

    pub fn server_message(&self, message_id: &str) -> Option<Message> {
        let state = self.state.lock().unwrap();
        state.messages.iter().find(|m| m.id == message_id).cloned()
    }

    pub fn update_server_message(&self, message_id: &str, content: &str, is_partial: bool) {
        let mut state = self.state.lock().unwrap();
        if let Some(m) = state.messages.iter_mut().find(|m| m.id == message_id) {
            m.content = MessageContent::from(content);
            m.is_partial = is_partial;
        }
    }

    pub fn drop_server_message(&self, message_id: &str) {
        self.state.lock().unwrap().messages.retain(|m| m.id != message_id);
    }

    pub fn continue_requests(&self) -> Vec<(String, MessageStream)> {
        self.state.lock().unwrap().continue_requests.clone()
    }

    pub fn abort_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().abort_calls.clone()
    }

    pub fn deleted_sessions(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_sessions.clone()
    }

    pub fn server_messages(&self, chat_id: &str) -> Vec<Message> {
        let state = self.state.lock().unwrap();
        state
            .messages
            .iter()
            .filter(|m| m.chat_session_id == chat_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ChatBackend for FakeBackend {
    async fn list_chat_sessions(&self) -> Result<Vec<ChatSession>, ApiError> {
        Ok(self.state.lock().unwrap().sessions.clone())
    }

    async fn create_chat_session(&self, req: &ChatSessionCreate) -> Result<ChatSession, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let session = ChatSession {
            id: format!("chat-{}", state.next_id + 100),
            name: req.name.clone(),
            user_id: "user-1".to_string(),
            root_message_id: None,
            created_at: base_time(),
        };
        state.sessions.push(session.clone());
        Ok(session)
    }

    async fn update_chat_session(&self, chat_id: &str, req: &ChatSessionCreate) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let session = state
            .sessions
            .iter_mut()
            .find(|s| s.id == chat_id)
            .ok_or_else(|| ApiError::NotFound("Chat session not found".to_string()))?;
        session.name = req.name.clone();
        Ok(())
    }

    async fn delete_chat_session(&self, chat_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.sessions.retain(|s| s.id != chat_id);
        state.messages.retain(|m| m.chat_session_id != chat_id);
        state.deleted_sessions.push(chat_id.to_string());
        Ok(())
    }

    async fn get_chat_session(&self, chat_id: &str) -> Result<ChatSessionWithMessages, ApiError> {
        let state = self.state.lock().unwrap();
        let session = state
            .sessions
            .iter()
            .find(|s| s.id == chat_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound("Chat session not found".to_string()))?;
        let messages = state
            .messages
            .iter()
            .filter(|m| m.chat_session_id == chat_id)
            .cloned()
            .collect();
        Ok(ChatSessionWithMessages { session, messages })
    }

    async fn create_message(&self, chat_id: &str, req: &MessageCreate) -> Result<Message, ApiError> {
        let (message, gate) = {
            let mut state = self.state.lock().unwrap();
            if req.role == Role::User && state.fail_user_create {
                return Err(ApiError::Network("connection reset".to_string()));
            }
            if !state.sessions.iter().any(|s| s.id == chat_id) {
                return Err(ApiError::NotFound("Chat session not found".to_string()));
            }
            state.next_id += 1;
            let message = Message {
                id: format!("m{}", state.next_id),
                chat_session_id: chat_id.to_string(),
                role: req.role,
                content: req.content.clone(),
                parent_message_id: req.parent_message_id.clone(),
                timestamp: base_time() + Duration::seconds(state.next_id as i64),
                is_partial: false,
                model: None,
                provider: None,
            };
            state.messages.push(message.clone());
            let gate = state
                .held
                .as_ref()
                .filter(|(role, _)| *role == req.role)
                .map(|(_, gate)| gate.clone());
            (message, gate)
        };
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }
        Ok(message)
    }

    async fn edit_message(&self, message_id: &str, req: &MessageCreate) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        let message = state
            .messages
            .iter_mut()
            .find(|m| m.id == message_id)
            .ok_or_else(|| ApiError::NotFound("Message not found".to_string()))?;
        message.content = req.content.clone();
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        self.state.lock().unwrap().messages.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn continue_stream(
        &self,
        _chat_id: &str,
        message_id: &str,
        req: &MessageStream,
    ) -> Result<FragmentStream, ApiError> {
        let mut state = self.state.lock().unwrap();
        state.continue_requests.push((message_id.to_string(), req.clone()));
        if state.reject_stream {
            return Err(ApiError::Api {
                status: 400,
                detail: "No API key stored for provider".to_string(),
            });
        }
        let (tx, rx) = unbounded_channel();
        state.feeds.insert(message_id.to_string(), tx);
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn abort_stream(&self, message_id: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.abort_calls.push(message_id.to_string());
        if state.fail_abort {
            return Err(ApiError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    async fn list_providers(&self) -> Result<Vec<ProviderInfo>, ApiError> {
        Ok(self.state.lock().unwrap().providers.clone())
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        Ok(self.state.lock().unwrap().models.clone())
    }
}

pub fn model_info(provider: &str, name: &str) -> ModelInfo {
    ModelInfo {
        name: name.to_string(),
        provider: provider.to_string(),
        description: String::new(),
        max_tokens: 4096,
    }
}

/// Waits until the next delta for `message_id` has been applied.
pub async fn next_delta(events: &mut broadcast::Receiver<ThreadEvent>, message_id: &str) -> String {
    loop {
        match events.recv().await.expect("event channel closed") {
            ThreadEvent::Delta { message_id: id, fragment } if id == message_id => return fragment,
            _ => {}
        }
    }
}

/// Yields until `check` holds.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
