use std::sync::Arc;

use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::models::{MessageContent, MessageStream, StreamEvent};
use crate::api::{ChatBackend, FragmentStream};
use crate::chat::store::MessageStore;
use crate::chat::{ChatError, Session, SessionState, ThreadEvent};

/// Per-session stream lifecycle:
/// `Idle -> Requesting -> Streaming -> Finalizing -> Idle`, with
/// `Streaming -> Aborting -> Idle` on user abort.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    Requesting(String),
    Streaming(String),
    Finalizing(String),
    Aborting(String),
}

impl StreamState {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            StreamState::Idle => None,
            StreamState::Requesting(id)
            | StreamState::Streaming(id)
            | StreamState::Finalizing(id)
            | StreamState::Aborting(id) => Some(id),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, StreamState::Idle)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleStatus {
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

/// Ties one backend stream to the message it fills. Refers to the message
/// by id only; the store owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    pub message_id: String,
    pub generation: u64,
    pub status: HandleStatus,
    pub fragments: usize,
}

/// Synchronous transitions of the per-session stream slot. Every method
/// that touches content takes the store it writes to, so callers apply
/// the transition and the store change under the same lock.
#[derive(Debug, Default)]
pub struct StreamMachine {
    state: StreamState,
    handle: Option<StreamHandle>,
    next_generation: u64,
}

impl StreamMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Most recent handle, live or terminal.
    pub fn handle(&self) -> Option<&StreamHandle> {
        self.handle.as_ref()
    }

    /// Message whose local content must not be overwritten by reloads.
    pub fn live_message(&self) -> Option<&str> {
        self.state.message_id()
    }

    fn current(&mut self, generation: u64) -> Option<&mut StreamHandle> {
        self.handle.as_mut().filter(|h| h.generation == generation)
    }

    /// `Idle -> Requesting`. Any other state is a conflict.
    pub fn begin(&mut self, message_id: &str) -> Result<u64, ChatError> {
        if let Some(active) = self.state.message_id() {
            return Err(ChatError::Conflict(active.to_string()));
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.handle = Some(StreamHandle {
            message_id: message_id.to_string(),
            generation,
            status: HandleStatus::Idle,
            fragments: 0,
        });
        self.state = StreamState::Requesting(message_id.to_string());
        Ok(generation)
    }

    /// `Requesting -> Streaming` once the backend accepted the request.
    pub fn accept(&mut self, generation: u64) -> bool {
        let StreamState::Requesting(id) = &self.state else {
            return false;
        };
        let id = id.clone();
        match self.current(generation) {
            Some(handle) => handle.status = HandleStatus::Streaming,
            None => return false,
        }
        self.state = StreamState::Streaming(id);
        true
    }

    /// `Requesting -> Idle` when the backend refused the request.
    pub fn reject(&mut self, store: &mut MessageStore, generation: u64) -> bool {
        if !matches!(self.state, StreamState::Requesting(_)) {
            return false;
        }
        let Some(handle) = self.current(generation) else {
            return false;
        };
        handle.status = HandleStatus::Failed;
        let message_id = handle.message_id.clone();
        self.state = StreamState::Idle;
        store.finalize(&message_id, None);
        true
    }

    /// Applies one fragment in arrival order. Returns `Ok(false)` when the
    /// fragment belongs to a stream that is no longer streaming.
    pub fn apply(&mut self, store: &mut MessageStore, generation: u64, fragment: &str) -> Result<bool, ChatError> {
        if !matches!(self.state, StreamState::Streaming(_)) {
            return Ok(false);
        }
        let Some(handle) = self.current(generation) else {
            return Ok(false);
        };
        store.apply_delta(&handle.message_id, fragment)?;
        handle.fragments += 1;
        Ok(true)
    }

    /// `Streaming -> Finalizing -> Idle` on the backend's terminal signal.
    pub fn complete(&mut self, store: &mut MessageStore, generation: u64, final_content: Option<MessageContent>) -> bool {
        let StreamState::Streaming(id) = &self.state else {
            return false;
        };
        let id = id.clone();
        if self.current(generation).is_none() {
            return false;
        }
        self.state = StreamState::Finalizing(id.clone());
        store.finalize(&id, final_content);
        if let Some(handle) = self.current(generation) {
            handle.status = HandleStatus::Completed;
        }
        self.state = StreamState::Idle;
        true
    }

    /// `Streaming -> Aborting`. Only a streaming message can be aborted.
    pub fn begin_abort(&mut self, message_id: &str) -> Result<u64, ChatError> {
        match &self.state {
            StreamState::Streaming(id) if id == message_id => {}
            StreamState::Idle => {
                return Err(ChatError::InvalidState(format!(
                    "no stream is active for message {}",
                    message_id
                )))
            }
            other => {
                return Err(ChatError::InvalidState(format!(
                    "cannot abort message {} while stream is {:?}",
                    message_id, other
                )))
            }
        }
        let generation = self.handle.as_ref().map(|h| h.generation).unwrap_or_default();
        self.state = StreamState::Aborting(message_id.to_string());
        Ok(generation)
    }

    /// `Aborting -> Idle`, keeping whatever content already arrived.
    pub fn finish_abort(&mut self, store: &mut MessageStore, generation: u64) -> bool {
        let StreamState::Aborting(id) = &self.state else {
            return false;
        };
        let id = id.clone();
        store.finalize(&id, None);
        if let Some(handle) = self.current(generation) {
            handle.status = HandleStatus::Aborted;
        }
        self.state = StreamState::Idle;
        true
    }

    /// `Streaming -> Idle` after a transport failure. Accumulated content is
    /// kept and the message carries a failure marker.
    pub fn fail(&mut self, store: &mut MessageStore, generation: u64, reason: &str) -> bool {
        let StreamState::Streaming(id) = &self.state else {
            return false;
        };
        let id = id.clone();
        let Some(handle) = self.current(generation) else {
            return false;
        };
        handle.status = HandleStatus::Failed;
        self.state = StreamState::Idle;
        store.finalize(&id, None);
        store.mark_failed(&id, reason);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortOutcome {
    pub message_id: String,
    /// Whether the backend confirmed the abort. Local state is settled
    /// either way.
    pub acknowledged: bool,
}

/// A running stream. Dropping it does not stop the stream.
#[derive(Debug)]
pub struct StreamTask {
    message_id: String,
    handle: JoinHandle<Result<StreamOutcome, ChatError>>,
}

impl StreamTask {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<StreamOutcome, ChatError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(StreamOutcome::Aborted),
            Err(e) => Err(ChatError::StreamFailed {
                message_id: self.message_id,
                reason: e.to_string(),
            }),
        }
    }
}

/// Drives the stream slot of one chat session against the backend.
#[derive(Clone)]
pub struct StreamManager {
    backend: Arc<dyn ChatBackend>,
    session: Arc<Session>,
}

impl StreamManager {
    pub(crate) fn new(backend: Arc<dyn ChatBackend>, session: Arc<Session>) -> Self {
        Self { backend, session }
    }

    pub async fn state(&self) -> StreamState {
        self.session.state.lock().await.machine.state().clone()
    }

    /// Starts streaming into `message_id`, which must already be in the
    /// store and marked partial. Fails with `Conflict` while another stream
    /// of this session is live.
    pub async fn start(
        &self,
        message_id: &str,
        model: &str,
        provider: &str,
        parent_message_id: Option<&str>,
    ) -> Result<StreamTask, ChatError> {
        let generation = {
            let mut state = self.session.state.lock().await;
            claim(&mut state, message_id)?
        };
        self.launch(message_id, generation, model, provider, parent_message_id)
            .await
    }

    /// Sends the continue request for a slot already claimed under the
    /// session lock and spawns the pump.
    pub(crate) async fn launch(
        &self,
        message_id: &str,
        generation: u64,
        model: &str,
        provider: &str,
        parent_message_id: Option<&str>,
    ) -> Result<StreamTask, ChatError> {
        let request = MessageStream {
            model: model.to_string(),
            provider: provider.to_string(),
            parent_message_id: parent_message_id.map(str::to_string),
        };

        let fragments = match self
            .backend
            .continue_stream(&self.session.chat_id, message_id, &request)
            .await
        {
            Ok(fragments) => fragments,
            Err(e) => {
                error!("Backend refused stream for message {}: {}", message_id, e);
                let mut state = self.session.state.lock().await;
                let state = &mut *state;
                if state.machine.reject(&mut state.store, generation) {
                    self.session.notify(ThreadEvent::Failed {
                        message_id: message_id.to_string(),
                        reason: e.to_string(),
                    });
                }
                return Err(e.into());
            }
        };

        let mut state = self.session.state.lock().await;
        if !state.machine.accept(generation) {
            return Err(ChatError::InvalidState(format!(
                "stream for message {} was superseded before it was accepted",
                message_id
            )));
        }
        info!("Streaming into message {} with {}/{}", message_id, provider, model);

        let session = self.session.clone();
        let id = message_id.to_string();
        let handle = tokio::spawn(pump(session, fragments, id, generation));
        state.pump = Some(handle.abort_handle());

        Ok(StreamTask {
            message_id: message_id.to_string(),
            handle,
        })
    }

    /// Aborts the streaming message. Local state reaches `Idle` and the
    /// message is finalized before the backend is contacted; the network
    /// outcome only shows up in `acknowledged`.
    pub async fn abort(&self, message_id: &str) -> Result<AbortOutcome, ChatError> {
        {
            let mut state = self.session.state.lock().await;
            let state = &mut *state;
            let generation = state.machine.begin_abort(message_id)?;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            state.machine.finish_abort(&mut state.store, generation);
        }
        self.session.notify(ThreadEvent::Aborted {
            message_id: message_id.to_string(),
        });

        let acknowledged = match self.backend.abort_stream(message_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Abort request for message {} failed: {}", message_id, e);
                false
            }
        };

        Ok(AbortOutcome {
            message_id: message_id.to_string(),
            acknowledged,
        })
    }
}

/// `Idle -> Requesting` for `message_id`. A live slot is a conflict whatever
/// the target; only then must the target exist and still be partial.
pub(crate) fn claim(state: &mut SessionState, message_id: &str) -> Result<u64, ChatError> {
    if let Some(active) = state.machine.live_message() {
        return Err(ChatError::Conflict(active.to_string()));
    }
    let message = state
        .store
        .get(message_id)
        .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
    if !message.is_partial {
        return Err(ChatError::InvalidState(format!(
            "message {} is finalized and cannot be streamed into",
            message_id
        )));
    }
    state.machine.begin(message_id)
}

async fn pump(
    session: Arc<Session>,
    mut fragments: FragmentStream,
    message_id: String,
    generation: u64,
) -> Result<StreamOutcome, ChatError> {
    loop {
        let next = fragments.next().await;
        let mut state = session.state.lock().await;
        let state = &mut *state;

        match next {
            Some(Ok(StreamEvent::Chunk(fragment))) => {
                match state.machine.apply(&mut state.store, generation, &fragment) {
                    Ok(true) => session.notify(ThreadEvent::Delta {
                        message_id: message_id.clone(),
                        fragment,
                    }),
                    Ok(false) => {
                        debug!("Dropping fragment for superseded stream of {}", message_id);
                        return Ok(StreamOutcome::Aborted);
                    }
                    Err(e) => return fail(&session, state, generation, message_id, e.to_string()),
                }
            }
            Some(Ok(StreamEvent::Done(final_content))) => {
                return Ok(finish(&session, state, generation, &message_id, final_content));
            }
            None => return Ok(finish(&session, state, generation, &message_id, None)),
            Some(Ok(StreamEvent::Error(reason))) => {
                return fail(&session, state, generation, message_id, reason);
            }
            Some(Err(e)) => return fail(&session, state, generation, message_id, e.to_string()),
        }
    }
}

fn finish(
    session: &Session,
    state: &mut SessionState,
    generation: u64,
    message_id: &str,
    final_content: Option<MessageContent>,
) -> StreamOutcome {
    if !state.machine.complete(&mut state.store, generation, final_content) {
        return StreamOutcome::Aborted;
    }
    state.pump = None;
    info!("Stream for message {} completed", message_id);
    session.notify(ThreadEvent::Finalized {
        message_id: message_id.to_string(),
    });
    StreamOutcome::Completed
}

fn fail(
    session: &Session,
    state: &mut SessionState,
    generation: u64,
    message_id: String,
    reason: String,
) -> Result<StreamOutcome, ChatError> {
    if !state.machine.fail(&mut state.store, generation, &reason) {
        // Aborted while the failure was in flight; the abort already settled it.
        return Ok(StreamOutcome::Aborted);
    }
    state.pump = None;
    warn!("Stream for message {} failed: {}", message_id, reason);
    session.notify(ThreadEvent::Failed {
        message_id: message_id.clone(),
        reason: reason.clone(),
    });
    Err(ChatError::StreamFailed { message_id, reason })
}
