//! In-memory message tree for one chat session.
//!
//! Messages live in an arena keyed by id; `parent_message_id` links form the
//! tree. Nothing owns its children, so removing a message never cascades and
//! broken links only affect where a message is rendered.

use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use crate::api::models::{Message, MessageContent};
use crate::api::ChatBackend;
use crate::chat::ChatError;

#[derive(Debug, Default)]
pub struct MessageStore {
    chat_id: Option<String>,
    messages: HashMap<String, Message>,
    /// Insertion sequence per id, used to order siblings deterministically.
    seq: HashMap<String, u64>,
    next_seq: u64,
    failures: HashMap<String, String>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.chat_id.as_deref()
    }

    /// Fetches the full thread for `chat_id` and replaces local state with it.
    pub async fn load(&mut self, backend: &dyn ChatBackend, chat_id: &str) -> Result<Vec<Message>, ChatError> {
        let thread = backend.get_chat_session(chat_id).await?;
        self.replace_all(chat_id, thread.messages);
        Ok(self.ordered().into_iter().cloned().collect())
    }

    pub fn replace_all(&mut self, chat_id: &str, messages: Vec<Message>) {
        self.chat_id = Some(chat_id.to_string());
        self.messages.clear();
        self.seq.clear();
        self.failures.clear();
        self.next_seq = 0;
        for message in messages {
            self.append(message);
        }
    }

    /// Inserts a message. An id that is already present is left untouched.
    pub fn append(&mut self, message: Message) -> bool {
        if self.messages.contains_key(&message.id) {
            warn!("Ignoring duplicate message {}", message.id);
            return false;
        }
        self.seq.insert(message.id.clone(), self.next_seq);
        self.next_seq += 1;
        self.messages.insert(message.id.clone(), message);
        true
    }

    /// Overwrites an existing message wholesale, keeping its position.
    pub fn replace(&mut self, message: Message) -> bool {
        match self.messages.get_mut(&message.id) {
            Some(existing) => {
                *existing = message;
                true
            }
            None => false,
        }
    }

    pub fn apply_delta(&mut self, message_id: &str, fragment: &str) -> Result<(), ChatError> {
        let message = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;

        if !message.is_partial {
            return Err(ChatError::InvalidState(format!(
                "message {} is not receiving content",
                message_id
            )));
        }

        match &mut message.content {
            MessageContent::Text(text) => text.push_str(fragment),
            MessageContent::Structured(serde_json::Value::Null) => {
                message.content = MessageContent::Text(fragment.to_string());
            }
            MessageContent::Structured(_) => {
                return Err(ChatError::InvalidState(format!(
                    "message {} has structured content and cannot take text fragments",
                    message_id
                )));
            }
        }
        Ok(())
    }

    /// Marks a message complete, optionally replacing its accumulated
    /// content. Returns whether anything changed; finalizing twice, or
    /// finalizing an id that is gone, is a no-op.
    pub fn finalize(&mut self, message_id: &str, final_content: Option<MessageContent>) -> bool {
        let Some(message) = self.messages.get_mut(message_id) else {
            debug!("Finalize for unknown message {}", message_id);
            return false;
        };
        if !message.is_partial {
            return false;
        }
        if let Some(content) = final_content {
            message.content = content;
        }
        message.is_partial = false;
        true
    }

    /// Deletes one message. Its children stay and render as orphans.
    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        self.seq.remove(message_id);
        self.failures.remove(message_id);
        self.messages.remove(message_id)
    }

    pub fn mark_failed(&mut self, message_id: &str, reason: &str) {
        if self.messages.contains_key(message_id) {
            self.failures.insert(message_id.to_string(), reason.to_string());
        }
    }

    /// Inline failure marker left by a stream that broke off.
    pub fn failure(&self, message_id: &str) -> Option<&str> {
        self.failures.get(message_id).map(String::as_str)
    }

    pub fn get(&self, message_id: &str) -> Option<&Message> {
        self.messages.get(message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.messages.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.messages.keys().cloned().collect()
    }

    fn sort_key(&self, message: &Message) -> (chrono::DateTime<chrono::Utc>, u64) {
        (message.timestamp, self.seq.get(&message.id).copied().unwrap_or(u64::MAX))
    }

    fn sorted<'a>(&self, mut messages: Vec<&'a Message>) -> Vec<&'a Message> {
        messages.sort_by_key(|m| self.sort_key(m));
        messages
    }

    /// Render order: depth-first from each root, siblings by timestamp then
    /// insertion. Messages whose parent chain is broken (missing parent or a
    /// cycle) are appended at the end, followed by their own descendants.
    pub fn ordered(&self) -> Vec<&Message> {
        let mut children: HashMap<&str, Vec<&Message>> = HashMap::new();
        let mut roots = Vec::new();
        for message in self.messages.values() {
            match message.parent_message_id.as_deref() {
                None => roots.push(message),
                Some(parent) => children.entry(parent).or_default().push(message),
            }
        }
        for siblings in children.values_mut() {
            siblings.sort_by_key(|m| self.sort_key(m));
        }

        let mut out = Vec::with_capacity(self.messages.len());
        let mut visited: HashSet<&str> = HashSet::new();

        for root in self.sorted(roots) {
            walk(root, &children, &mut visited, &mut out);
        }

        let leftovers: Vec<&Message> = self
            .messages
            .values()
            .filter(|m| !visited.contains(m.id.as_str()))
            .collect();
        for message in self.sorted(leftovers) {
            if !visited.contains(message.id.as_str()) {
                walk(message, &children, &mut visited, &mut out);
            }
        }
        out
    }

    /// Path from the root down to `message_id`. Stops early at a missing
    /// parent or a cycle.
    pub fn lineage(&self, message_id: &str) -> Vec<&Message> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = self.messages.get(message_id);
        while let Some(message) = current {
            if !seen.insert(message.id.as_str()) {
                break;
            }
            path.push(message);
            current = message
                .parent_message_id
                .as_deref()
                .and_then(|parent| self.messages.get(parent));
        }
        path.reverse();
        path
    }

    /// Last message of the rendered thread.
    pub fn tail_id(&self) -> Option<String> {
        self.ordered().last().map(|m| m.id.clone())
    }
}

fn walk<'a>(
    start: &'a Message,
    children: &HashMap<&str, Vec<&'a Message>>,
    visited: &mut HashSet<&'a str>,
    out: &mut Vec<&'a Message>,
) {
    let mut stack = vec![start];
    while let Some(message) = stack.pop() {
        if !visited.insert(message.id.as_str()) {
            continue;
        }
        out.push(message);
        if let Some(kids) = children.get(message.id.as_str()) {
            for child in kids.iter().rev() {
                stack.push(*child);
            }
        }
    }
}
