use async_trait::async_trait;
use reqwest::{header, Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::api::models::{
    ChatSession, ChatSessionCreate, ChatSessionWithMessages, Message, MessageCreate, MessageStream,
    ModelInfo, ProviderInfo, ProviderKey, ProviderKeyCreate, SsoExchangeRequest, Token, User,
};
use crate::api::stream::{decode_body, poll_message, BodyFormat, PollSettings};
use crate::api::{ApiError, ChatBackend, FragmentStream};
use crate::config::{BackendConfig, StreamConfig};

/// HTTP client for the chat backend. Each instance carries its own bearer
/// token; cloning is cheap and shares the connection pool.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    poll: PollSettings,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("authorized", &self.token.is_some())
            .finish()
    }
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            request_timeout: Duration::from_secs(30),
            poll: PollSettings::default(),
        }
    }

    pub fn from_config(backend: &BackendConfig, stream: &StreamConfig) -> Result<Self, ApiError> {
        // No overall client timeout: it would also cut off long streaming bodies.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(backend.connect_timeout_secs))
            .build()
            .map_err(|e| ApiError::Network(e.to_string()))?;

        Ok(Self {
            client,
            base_url: backend.base_url.trim_end_matches('/').to_string(),
            token: None,
            request_timeout: Duration::from_secs(backend.request_timeout_secs),
            poll: PollSettings {
                interval: stream.poll_interval(),
                stall_timeout: stream.stall_timeout(),
            },
        })
    }

    /// Returns a client that authenticates as the holder of `token`.
    pub fn with_token(&self, token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..self.clone()
        }
    }

    pub fn without_token(&self) -> Self {
        Self {
            token: None,
            ..self.clone()
        }
    }

    pub fn with_poll_settings(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn is_authorized(&self) -> bool {
        self.token.is_some()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, endpoint))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = &self.token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, ApiError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ApiError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, error_detail(status, &text)));
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        let builder = self.request(Method::GET, endpoint).timeout(self.request_timeout);
        decode_json(self.send(builder).await?).await
    }

    async fn send_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let builder = self.request(method, endpoint).timeout(self.request_timeout).json(body);
        decode_json(self.send(builder).await?).await
    }

    /// For endpoints whose success body is empty or irrelevant.
    async fn send_void<B: Serialize + ?Sized>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<(), ApiError> {
        let mut builder = self.request(method, endpoint).timeout(self.request_timeout);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        self.send(builder).await?;
        Ok(())
    }

    // --- Auth ---

    pub async fn google_sso(&self, id_token: &str) -> Result<Token, ApiError> {
        let body = SsoExchangeRequest {
            token: id_token.to_string(),
        };
        self.send_json(Method::POST, "/auth/google-sso", &body).await
    }

    pub async fn current_user(&self) -> Result<User, ApiError> {
        self.get_json("/auth/session").await
    }

    pub async fn logout(&self) -> Result<(), ApiError> {
        self.send_void::<()>(Method::POST, "/auth/logout", None).await
    }

    // --- Chat sessions ---

    pub async fn list_chat_sessions(&self) -> Result<Vec<ChatSession>, ApiError> {
        self.get_json("/chats/").await
    }

    pub async fn create_chat_session(&self, req: &ChatSessionCreate) -> Result<ChatSession, ApiError> {
        self.send_json(Method::POST, "/chats/", req).await
    }

    pub async fn get_chat_session(&self, chat_id: &str) -> Result<ChatSessionWithMessages, ApiError> {
        self.get_json(&format!("/chats/{}", chat_id)).await
    }

    pub async fn update_chat_session(&self, chat_id: &str, req: &ChatSessionCreate) -> Result<(), ApiError> {
        self.send_void(Method::PATCH, &format!("/chats/{}", chat_id), Some(req)).await
    }

    pub async fn delete_chat_session(&self, chat_id: &str) -> Result<(), ApiError> {
        self.send_void::<()>(Method::DELETE, &format!("/chats/{}", chat_id), None).await
    }

    // --- Messages ---

    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>, ApiError> {
        self.get_json(&format!("/chats/{}/messages", chat_id)).await
    }

    pub async fn create_message(&self, chat_id: &str, req: &MessageCreate) -> Result<Message, ApiError> {
        self.send_json(Method::POST, &format!("/chats/{}/messages", chat_id), req).await
    }

    pub async fn edit_message(&self, message_id: &str, req: &MessageCreate) -> Result<(), ApiError> {
        self.send_void(Method::PATCH, &format!("/chats/messages/{}", message_id), Some(req)).await
    }

    pub async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        self.send_void::<()>(Method::DELETE, &format!("/chats/messages/{}", message_id), None)
            .await
    }

    // --- Streaming ---

    pub async fn continue_stream(
        &self,
        chat_id: &str,
        message_id: &str,
        req: &MessageStream,
    ) -> Result<FragmentStream, ApiError> {
        let builder = self
            .request(Method::POST, &format!("/stream/{}/continue", message_id))
            .header(header::ACCEPT, "text/event-stream, application/x-ndjson, application/json")
            .json(req);
        let response = self.send(builder).await?;

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match BodyFormat::from_content_type(content_type.as_deref()) {
            Some(format) => {
                debug!("Streaming message {} inline as {:?}", message_id, format);
                Ok(decode_body(response.bytes_stream(), format))
            }
            None => {
                debug!("Backend acknowledged message {}; polling thread {}", message_id, chat_id);
                let client = self.clone();
                let chat_id = chat_id.to_string();
                Ok(poll_message(
                    move || {
                        let client = client.clone();
                        let chat_id = chat_id.clone();
                        async move { client.get_chat_session(&chat_id).await }
                    },
                    message_id.to_string(),
                    self.poll,
                ))
            }
        }
    }

    pub async fn abort_stream(&self, message_id: &str) -> Result<(), ApiError> {
        self.send_void::<()>(Method::POST, &format!("/stream/{}/abort", message_id), None)
            .await
    }

    // --- Provider keys ---

    pub async fn list_provider_keys(&self) -> Result<Vec<ProviderKey>, ApiError> {
        self.get_json("/user/keys/").await
    }

    pub async fn add_provider_key(&self, req: &ProviderKeyCreate) -> Result<ProviderKey, ApiError> {
        self.send_json(Method::POST, "/user/keys/", req).await
    }

    pub async fn delete_provider_key(&self, key_id: &str) -> Result<(), ApiError> {
        self.send_void::<()>(Method::DELETE, &format!("/user/keys/{}", key_id), None).await
    }

    // --- System info ---

    pub async fn list_providers(&self) -> Result<Vec<ProviderInfo>, ApiError> {
        self.get_json("/providers").await
    }

    pub async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        self.get_json("/models").await
    }

    pub async fn health_check(&self) -> Result<serde_json::Value, ApiError> {
        self.get_json("/health").await
    }
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ApiError::Network(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode(e.to_string()))
}

/// Extracts the backend's `detail` message from an error body. Validation
/// errors carry a list of `{loc, msg, type}` items instead of a string.
pub fn error_detail(status: u16, body: &str) -> String {
    let fallback = || format!("HTTP error! status: {}", status);

    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return fallback();
    };

    match json.get("detail") {
        Some(serde_json::Value::String(detail)) if !detail.is_empty() => detail.clone(),
        Some(serde_json::Value::Array(items)) => {
            let messages: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("msg").and_then(|m| m.as_str()))
                .collect();
            if messages.is_empty() {
                fallback()
            } else {
                messages.join("; ")
            }
        }
        _ => fallback(),
    }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn list_chat_sessions(&self) -> Result<Vec<ChatSession>, ApiError> {
        ApiClient::list_chat_sessions(self).await
    }

    async fn create_chat_session(&self, req: &ChatSessionCreate) -> Result<ChatSession, ApiError> {
        ApiClient::create_chat_session(self, req).await
    }

    async fn update_chat_session(&self, chat_id: &str, req: &ChatSessionCreate) -> Result<(), ApiError> {
        ApiClient::update_chat_session(self, chat_id, req).await
    }

    async fn delete_chat_session(&self, chat_id: &str) -> Result<(), ApiError> {
        ApiClient::delete_chat_session(self, chat_id).await
    }

    async fn get_chat_session(&self, chat_id: &str) -> Result<ChatSessionWithMessages, ApiError> {
        ApiClient::get_chat_session(self, chat_id).await
    }

    async fn create_message(&self, chat_id: &str, req: &MessageCreate) -> Result<Message, ApiError> {
        ApiClient::create_message(self, chat_id, req).await
    }

    async fn edit_message(&self, message_id: &str, req: &MessageCreate) -> Result<(), ApiError> {
        ApiClient::edit_message(self, message_id, req).await
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        ApiClient::delete_message(self, message_id).await
    }

    async fn continue_stream(
        &self,
        chat_id: &str,
        message_id: &str,
        req: &MessageStream,
    ) -> Result<FragmentStream, ApiError> {
        ApiClient::continue_stream(self, chat_id, message_id, req).await
    }

    async fn abort_stream(&self, message_id: &str) -> Result<(), ApiError> {
        ApiClient::abort_stream(self, message_id).await
    }

    async fn list_providers(&self) -> Result<Vec<ProviderInfo>, ApiError> {
        ApiClient::list_providers(self).await
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, ApiError> {
        ApiClient::list_models(self).await
    }
}
