//! Turns a `/stream/{id}/continue` response into an ordered sequence of
//! [`StreamEvent`]s.
//!
//! Three inline body formats are understood (server-sent events, newline
//! delimited JSON and raw chunked text). When the backend only acknowledges
//! the request with a JSON body, content is picked up by polling the thread
//! instead, with a cursor over what has already been delivered.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{stream, Stream, StreamExt};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::models::{ChatSessionWithMessages, MessageContent, StreamEvent, WireStreamEvent};
use crate::api::{ApiError, FragmentStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    EventStream,
    NdJson,
    RawText,
}

impl BodyFormat {
    /// `None` means the body carries no content and the caller has to poll.
    pub fn from_content_type(content_type: Option<&str>) -> Option<Self> {
        let mime = content_type
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase())
            .unwrap_or_default();

        match mime.as_str() {
            "text/event-stream" => Some(BodyFormat::EventStream),
            "application/x-ndjson" | "application/jsonl" | "application/json-seq" => Some(BodyFormat::NdJson),
            "application/json" | "" => None,
            _ => Some(BodyFormat::RawText),
        }
    }
}

/// Incremental decoder. Bytes may be fed in arbitrary frames; lines and
/// UTF-8 sequences split across frames are reassembled.
#[derive(Debug)]
pub struct EventDecoder {
    format: BodyFormat,
    buffer: Vec<u8>,
    data: Option<String>,
    finished: bool,
}

impl EventDecoder {
    pub fn new(format: BodyFormat) -> Self {
        Self {
            format,
            buffer: Vec::new(),
            data: None,
            finished: false,
        }
    }

    /// True once a completion or error event has been produced. Anything fed
    /// afterwards is discarded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        if self.format == BodyFormat::RawText {
            let text = take_utf8(&mut self.buffer);
            if !text.is_empty() {
                events.push(StreamEvent::Chunk(text));
            }
            return events;
        }

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.strip_suffix('\r').unwrap_or(&line).to_string();
            self.process_line(&line, &mut events);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        events
    }

    /// Flushes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        match self.format {
            BodyFormat::RawText => {
                if !self.buffer.is_empty() {
                    let tail = String::from_utf8_lossy(&self.buffer).into_owned();
                    self.buffer.clear();
                    events.push(StreamEvent::Chunk(tail));
                }
            }
            BodyFormat::EventStream | BodyFormat::NdJson => {
                if !self.buffer.is_empty() {
                    let rest = String::from_utf8_lossy(&self.buffer).into_owned();
                    self.buffer.clear();
                    let rest = rest.strip_suffix('\r').unwrap_or(&rest).to_string();
                    self.process_line(&rest, &mut events);
                }
                if !self.finished {
                    self.dispatch_data(&mut events);
                }
            }
        }
        self.finished = true;
        events
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<StreamEvent>) {
        match self.format {
            BodyFormat::NdJson => {
                let line = line.trim();
                if line.is_empty() {
                    return;
                }
                match serde_json::from_str::<WireStreamEvent>(line) {
                    Ok(wire) => self.push_wire(wire, events),
                    Err(e) => warn!("Skipping undecodable stream line: {}", e),
                }
            }
            BodyFormat::EventStream => {
                if line.is_empty() {
                    self.dispatch_data(events);
                } else if line.starts_with(':') {
                    // keep-alive comment
                } else if let Some(value) = field_value(line, "data") {
                    match self.data.as_mut() {
                        Some(data) => {
                            data.push('\n');
                            data.push_str(value);
                        }
                        None => self.data = Some(value.to_string()),
                    }
                }
            }
            BodyFormat::RawText => {}
        }
    }

    fn dispatch_data(&mut self, events: &mut Vec<StreamEvent>) {
        let Some(data) = self.data.take() else {
            return;
        };
        if data.trim() == "[DONE]" {
            self.push(StreamEvent::Done(None), events);
            return;
        }
        match serde_json::from_str::<WireStreamEvent>(&data) {
            Ok(wire) => self.push_wire(wire, events),
            Err(_) => {
                debug!("Treating non-envelope SSE data as raw content");
                self.push(StreamEvent::Chunk(data), events);
            }
        }
    }

    fn push_wire(&mut self, wire: WireStreamEvent, events: &mut Vec<StreamEvent>) {
        let content = wire.content.filter(|c| !c.is_null());
        match wire.r#type.as_str() {
            "chunk" | "delta" | "token" => {
                if let Some(value) = content {
                    let text = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    if !text.is_empty() {
                        self.push(StreamEvent::Chunk(text), events);
                    }
                }
            }
            "done" | "complete" => {
                let final_content = content.and_then(|value| match value {
                    serde_json::Value::String(s) if s.is_empty() => None,
                    serde_json::Value::String(s) => Some(MessageContent::Text(s)),
                    other => Some(MessageContent::Structured(other)),
                });
                self.push(StreamEvent::Done(final_content), events);
            }
            "error" => {
                let reason = match content {
                    Some(serde_json::Value::String(s)) if !s.is_empty() => s,
                    Some(other) => other.to_string(),
                    None => "stream error".to_string(),
                };
                self.push(StreamEvent::Error(reason), events);
            }
            "status" => {}
            other => debug!("Ignoring stream event of type {}", other),
        }
    }

    fn push(&mut self, event: StreamEvent, events: &mut Vec<StreamEvent>) {
        if self.finished {
            return;
        }
        if matches!(event, StreamEvent::Done(_) | StreamEvent::Error(_)) {
            self.finished = true;
        }
        events.push(event);
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    if rest.is_empty() {
        return Some("");
    }
    let value = rest.strip_prefix(':')?;
    Some(value.strip_prefix(' ').unwrap_or(value))
}

/// Drains the longest valid UTF-8 prefix, leaving an incomplete trailing
/// sequence in the buffer for the next frame.
fn take_utf8(buffer: &mut Vec<u8>) -> String {
    match std::str::from_utf8(buffer) {
        Ok(text) => {
            let text = text.to_string();
            buffer.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let rest = buffer.split_off(valid);
            let text = String::from_utf8_lossy(buffer).into_owned();
            *buffer = rest;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(buffer).into_owned();
            buffer.clear();
            text
        }
    }
}

struct BodyState<S> {
    body: Pin<Box<S>>,
    decoder: EventDecoder,
    queue: VecDeque<StreamEvent>,
    closed: bool,
}

/// Decodes a byte stream into stream events. A transport error ends the
/// stream after being yielded once.
pub fn decode_body<S, B, E>(body: S, format: BodyFormat) -> FragmentStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = BodyState {
        body: Box::pin(body),
        decoder: EventDecoder::new(format),
        queue: VecDeque::new(),
        closed: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((Ok(event), state));
            }
            if state.closed || state.decoder.is_finished() {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let events = state.decoder.feed(bytes.as_ref());
                    state.queue.extend(events);
                }
                Some(Err(e)) => {
                    state.closed = true;
                    return Some((Err(ApiError::Network(e.to_string())), state));
                }
                None => {
                    state.closed = true;
                    let events = state.decoder.finish();
                    state.queue.extend(events);
                }
            }
        }
    })
    .boxed()
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub stall_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            stall_timeout: Duration::from_secs(60),
        }
    }
}

struct PollState<F> {
    fetch: F,
    message_id: String,
    settings: PollSettings,
    delivered: String,
    /// Last content seen on the server, delivered or not. Any change
    /// counts as progress.
    observed: String,
    queue: VecDeque<StreamEvent>,
    first: bool,
    last_progress: Instant,
    done: bool,
}

/// Polls the thread until the message stops being partial, emitting each
/// newly observed suffix of its content as a chunk.
pub fn poll_message<F, Fut>(fetch: F, message_id: String, settings: PollSettings) -> FragmentStream
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ChatSessionWithMessages, ApiError>> + Send + 'static,
{
    let state = PollState {
        fetch,
        message_id,
        settings,
        delivered: String::new(),
        observed: String::new(),
        queue: VecDeque::new(),
        first: true,
        last_progress: Instant::now(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            if !state.first {
                tokio::time::sleep(state.settings.interval).await;
            }
            state.first = false;

            let thread = match (state.fetch)().await {
                Ok(thread) => thread,
                Err(e) => {
                    state.done = true;
                    return Some((Err(e), state));
                }
            };

            let Some(message) = thread.messages.into_iter().find(|m| m.id == state.message_id) else {
                state.done = true;
                let err = ApiError::NotFound(format!("message {} is no longer in the thread", state.message_id));
                return Some((Err(err), state));
            };

            let text = message.content.as_text().into_owned();
            if text != state.observed {
                state.observed = text.clone();
                state.last_progress = Instant::now();
            }
            if text.len() > state.delivered.len() && text.starts_with(&state.delivered) {
                state.queue.push_back(StreamEvent::Chunk(text[state.delivered.len()..].to_string()));
                state.delivered = text;
            } else if !text.starts_with(&state.delivered) {
                debug!("Polled content for {} diverged from delivered prefix", state.message_id);
            }

            if !message.is_partial {
                state.done = true;
                state.queue.push_back(StreamEvent::Done(Some(message.content)));
                continue;
            }

            if state.last_progress.elapsed() > state.settings.stall_timeout {
                state.done = true;
                let err = ApiError::Network(format!(
                    "no progress on message {} for {:?}",
                    state.message_id, state.settings.stall_timeout
                ));
                state.queue.clear();
                return Some((Err(err), state));
            }
        }
    })
    .boxed()
}
