//! Plain-text transcripts of a chat session.
//!
//! ```text
//! Session: <name>
//! ID: <id>
//! Created At: <timestamp>
//! ---
//! [USER]: first line
//! more lines
//! ---
//! [ASSISTANT]: ...
//! ---
//! ```
//!
//! Continuation lines that would read as a separator or an entry header,
//! or that start with `\`, are written with one extra leading `\`.

use tracing::warn;

use crate::api::models::{ChatSession, ChatSessionCreate, Message, MessageContent, MessageCreate, Role};
use crate::api::ChatBackend;
use crate::chat::ChatError;

const SEPARATOR: &str = "---";
const ESCAPE: char = '\\';

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub name: String,
    pub entries: Vec<(Role, String)>,
}

pub fn render(session: &ChatSession, messages: &[Message]) -> String {
    let mut out = String::new();
    out.push_str(&format!("Session: {}\n", session.display_name()));
    out.push_str(&format!("ID: {}\n", session.id));
    out.push_str(&format!("Created At: {}\n", session.created_at));
    out.push_str(SEPARATOR);
    out.push('\n');

    for m in messages {
        let content = m.content.as_text();
        let mut lines = content.split('\n');
        out.push_str(&format!("[{}]: {}\n", m.role.as_str().to_uppercase(), lines.next().unwrap_or("")));
        for line in lines {
            if line == SEPARATOR || line.starts_with(ESCAPE) || entry_header(line).is_some() {
                out.push(ESCAPE);
            }
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(SEPARATOR);
        out.push('\n');
    }
    out
}

pub fn parse(text: &str) -> Transcript {
    let mut lines = text.lines();

    let name = lines
        .next()
        .and_then(|l| l.strip_prefix("Session: "))
        .unwrap_or("Imported Session")
        .to_string();

    // Skip the remaining header lines.
    for line in lines.by_ref() {
        if line == SEPARATOR {
            break;
        }
    }

    let mut entries = Vec::new();
    let mut current: Option<(Role, String)> = None;

    for line in lines {
        if line == SEPARATOR {
            if let Some((role, content)) = current.take() {
                entries.push((role, content));
            }
        } else if let Some((role, first)) = entry_header(line) {
            if let Some(previous) = current.replace((role, first.to_string())) {
                entries.push(previous);
            }
        } else if let Some((_, content)) = current.as_mut() {
            content.push('\n');
            content.push_str(line.strip_prefix(ESCAPE).unwrap_or(line));
        } else if !line.trim().is_empty() {
            warn!("Skipping transcript line outside of any message: {}", line);
        }
    }
    if let Some(last) = current {
        entries.push(last);
    }

    Transcript { name, entries }
}

fn entry_header(line: &str) -> Option<(Role, &str)> {
    let rest = line.strip_prefix('[')?;
    let end = rest.find("]: ")?;
    let role = Role::parse(&rest[..end])?;
    Some((role, &rest[end + 3..]))
}

/// Recreates a transcript as a new chat session whose messages form a
/// single parent chain.
pub async fn import(backend: &dyn ChatBackend, transcript: &Transcript) -> Result<ChatSession, ChatError> {
    let session = backend
        .create_chat_session(&ChatSessionCreate {
            name: Some(transcript.name.clone()),
        })
        .await?;

    let mut parent: Option<String> = None;
    for (role, content) in &transcript.entries {
        let req = MessageCreate {
            role: *role,
            content: MessageContent::from(content.trim()),
            parent_message_id: parent.clone(),
        };
        let message = backend.create_message(&session.id, &req).await?;
        parent = Some(message.id);
    }
    Ok(session)
}
