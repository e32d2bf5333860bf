pub mod commands;

use std::future::Future;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::api::models::{Message, ProviderKeyCreate};
use crate::api::{ApiClient, ApiError, AuthSession, ChatBackend};
use crate::chat::store::MessageStore;
use crate::chat::{transcript, Catalog, ChatError, ChatWorkspace, Conversation, SelectionState, StreamTask, ThreadEvent};
use crate::cli::commands::{Commands, KeyAction, SessionAction};
use crate::config::AppConfig;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration Error: {0}")]
    Config(#[from] config::ConfigError),
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("Not signed in: set auth.token (or TEEHEE__AUTH__TOKEN) to a token from `teehee login`")]
    NotSignedIn,
}

impl CliError {
    pub fn requires_reauth(&self) -> bool {
        match self {
            CliError::Chat(e) => e.requires_reauth(),
            CliError::Api(e) => e.is_auth(),
            CliError::NotSignedIn => true,
            _ => false,
        }
    }
}

pub async fn run_cli(command: Commands, config_path: String) -> Result<(), CliError> {
    let config = AppConfig::load(&config_path)?;
    let client = ApiClient::from_config(&config.backend, &config.stream)?;
    let backoff = Duration::from_millis(config.chat.read_retry_backoff_ms);

    match command {
        Commands::Login { id_token } => {
            let auth = AuthSession::exchange(&client, &id_token).await?;
            println!("Signed in as {} ({})", auth.user().email, auth.user().id);
            println!("export TEEHEE__AUTH__TOKEN={}", auth.access_token());
        }
        Commands::Whoami => {
            let auth = signed_in(&client, &config).await?;
            let user = auth.user();
            println!("{} ({}), member since {}", user.email, user.id, user.created_at);
        }
        Commands::Logout => {
            signed_in(&client, &config).await?.sign_out().await?;
            println!("Signed out.");
        }
        Commands::Models => {
            let auth = signed_in(&client, &config).await?;
            let catalog = with_read_retry(backoff, || Catalog::load(auth.client())).await?;
            if catalog.is_empty() {
                println!("The backend reports no models.");
            }
            for entry in catalog.entries() {
                println!("{}", entry.provider);
                for model in &entry.models {
                    println!("  {}", model);
                }
            }
        }
        Commands::Keys { action } => {
            let auth = signed_in(&client, &config).await?;
            run_keys(auth.client(), action).await?;
        }
        Commands::Sessions { action } => {
            let auth = signed_in(&client, &config).await?;
            let backend: Arc<dyn ChatBackend> = Arc::new(auth.client().clone());
            run_sessions(backend, &config, action, backoff).await?;
        }
        Commands::Chat {
            session,
            provider,
            model,
        } => {
            let auth = signed_in(&client, &config).await?;
            let backend: Arc<dyn ChatBackend> = Arc::new(auth.client().clone());
            run_repl(backend, &config, &session, provider, model, backoff).await?;
        }
    }
    Ok(())
}

async fn signed_in(client: &ApiClient, config: &AppConfig) -> Result<AuthSession, CliError> {
    let token = config.auth.token.as_deref().ok_or(CliError::NotSignedIn)?;
    Ok(AuthSession::resume(client, token).await?)
}

/// Retries a read once after `backoff` when it failed before reaching the
/// backend. Writes never go through here.
async fn with_read_retry<T, F, Fut>(backoff: Duration, op: F) -> Result<T, ChatError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ChatError>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!("Read failed ({}); retrying once in {:?}", e, backoff);
            tokio::time::sleep(backoff).await;
            op().await
        }
        other => other,
    }
}

async fn run_keys(client: &ApiClient, action: KeyAction) -> Result<(), CliError> {
    match action {
        KeyAction::List => {
            let keys = client.list_provider_keys().await?;
            if keys.is_empty() {
                println!("No provider keys stored.");
            } else {
                println!("{:<38} | {:<16} | {}", "ID", "Provider", "Created At");
                println!("{:-<38}-+-{:-<16}-+-{:-<20}", "", "", "");
                for k in keys {
                    println!("{:<38} | {:<16} | {}", k.id, k.provider_name, k.created_at);
                }
            }
        }
        KeyAction::Add { provider, key } => {
            let stored = client
                .add_provider_key(&ProviderKeyCreate {
                    provider_name: provider,
                    api_key: key,
                })
                .await?;
            println!("Stored key {} for {}", stored.id, stored.provider_name);
        }
        KeyAction::Delete { id } => {
            client.delete_provider_key(&id).await?;
            println!("Deleted key {}", id);
        }
    }
    Ok(())
}

async fn run_sessions(
    backend: Arc<dyn ChatBackend>,
    config: &AppConfig,
    action: SessionAction,
    backoff: Duration,
) -> Result<(), CliError> {
    let mut workspace = ChatWorkspace::with_event_buffer(backend.clone(), config.stream.event_buffer);

    match action {
        SessionAction::List => {
            let sessions = with_read_retry(backoff, || workspace.list_sessions()).await?;
            if sessions.is_empty() {
                println!("No sessions found.");
            } else {
                println!("{:<38} | {:<25} | {}", "ID", "Created At", "Name");
                println!("{:-<38}-+-{:-<25}-+-{:-<20}", "", "", "");
                for s in sessions {
                    println!("{:<38} | {:<25} | {}", s.id, s.created_at.to_rfc3339(), s.display_name());
                }
            }
        }
        SessionAction::Create { name } => {
            let session = workspace.create_session(name).await?;
            println!("Created Session: {} ({})", session.display_name(), session.id);
        }
        SessionAction::Rename { id, name } => {
            workspace.rename_session(&id, &name).await?;
            println!("Renamed session {} to {}", id, name);
        }
        SessionAction::Delete { id } => {
            workspace.delete_session(&id).await?;
            println!("Deleted session {}", id);
        }
        SessionAction::Show { id } => {
            let conversation = workspace.open(&id).await?;
            print_thread(&conversation).await;
        }
        SessionAction::Export { id, path } => {
            let thread = backend.get_chat_session(&id).await.map_err(ChatError::from)?;
            let mut store = MessageStore::new();
            store.replace_all(&id, thread.messages);
            let ordered: Vec<Message> = store.ordered().into_iter().cloned().collect();

            let export_path = path.unwrap_or_else(|| format!("session_{}.txt", id));
            std::fs::write(&export_path, transcript::render(&thread.session, &ordered))?;
            println!("Session exported successfully to: {}", export_path);
        }
        SessionAction::Import { path } => {
            let content = std::fs::read_to_string(&path)?;
            let parsed = transcript::parse(&content);
            let session = transcript::import(backend.as_ref(), &parsed).await?;
            println!(
                "Imported {} messages into session {} ({})",
                parsed.entries.len(),
                session.display_name(),
                session.id
            );
        }
    }
    Ok(())
}

async fn print_thread(conversation: &Conversation) {
    for m in conversation.thread().await {
        let attribution = match (&m.provider, &m.model) {
            (Some(p), Some(model)) => format!(" ({}/{})", p, model),
            _ => String::new(),
        };
        println!("[{}]{}: {}", m.role.as_str().to_uppercase(), attribution, m.content.as_text());
        if let Some(reason) = conversation.failure(&m.id).await {
            println!("  [stream failed: {}]", reason);
        }
    }
}

async fn run_repl(
    backend: Arc<dyn ChatBackend>,
    config: &AppConfig,
    chat_id: &str,
    provider: Option<String>,
    model: Option<String>,
    backoff: Duration,
) -> Result<(), CliError> {
    let catalog = with_read_retry(backoff, || Catalog::load(backend.as_ref())).await?;
    let mut selection = SelectionState::new(catalog);

    let preferred = provider
        .or_else(|| config.chat.default_provider.clone())
        .zip(model.or_else(|| config.chat.default_model.clone()));
    if let Some((p, m)) = preferred {
        if let Err(e) = selection.select(&p, &m) {
            eprintln!("{}; falling back to the default model", e);
        }
    }

    let mut workspace = ChatWorkspace::with_event_buffer(backend, config.stream.event_buffer);
    let conversation = workspace.open(chat_id).await?;

    println!("--- Teehee Terminal Chat ---");
    println!("Connected to Session: {}", chat_id);
    match selection.current() {
        Some(s) => println!("Model: {}", s),
        None => println!("Model: none available"),
    }
    println!("Commands: /model <provider> <model>, /regenerate, /refresh, /exit. Ctrl-C aborts a reply, or leaves at the prompt.");
    println!("----------------------------");
    print_thread(&conversation).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nUser> ");
        io::stdout().flush()?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(input) = line else {
            break;
        };
        let text = input.trim();

        if text.is_empty() {
            continue;
        }
        if text == "/exit" || text == "/quit" {
            break;
        }
        if let Some(rest) = text.strip_prefix("/model") {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            match parts.as_slice() {
                [p, m] => match selection.select(p, m) {
                    Ok(s) => println!("Model: {}", s),
                    Err(e) => eprintln!("{}", e),
                },
                _ => {
                    for entry in selection.catalog().entries() {
                        println!("{}: {}", entry.provider, entry.models.join(", "));
                    }
                }
            }
            continue;
        }
        if text == "/refresh" {
            match conversation.refresh().await {
                Ok(report) if report.is_noop() => println!("Up to date."),
                Ok(_) => print_thread(&conversation).await,
                Err(e) if e.requires_reauth() => return Err(e.into()),
                Err(e) => eprintln!("Refresh failed: {}", e),
            }
            continue;
        }

        let mut events = conversation.subscribe();
        let started = if text == "/regenerate" {
            let parent = conversation
                .thread()
                .await
                .into_iter()
                .rev()
                .find(|m| m.role == crate::api::models::Role::User)
                .map(|m| m.id);
            match parent {
                Some(parent) => conversation.regenerate(&parent, &selection).await,
                None => {
                    eprintln!("Nothing to regenerate.");
                    continue;
                }
            }
        } else {
            conversation.send(text, &selection).await
        };

        match started {
            Ok(task) => stream_reply(&conversation, task, &mut events).await?,
            Err(e) if e.requires_reauth() => return Err(e.into()),
            Err(e) => eprintln!("Failed to send message: {}", e),
        }
    }
    Ok(())
}

async fn stream_reply(
    conversation: &Conversation,
    task: StreamTask,
    events: &mut broadcast::Receiver<ThreadEvent>,
) -> Result<(), CliError> {
    let message_id = task.message_id().to_string();
    let mut shown = String::new();

    print!("Teehee> ");
    io::stdout().flush()?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ThreadEvent::Delta { message_id: id, fragment }) if id == message_id => {
                    print!("{}", fragment);
                    io::stdout().flush()?;
                    shown.push_str(&fragment);
                }
                Ok(ThreadEvent::Finalized { message_id: id }) if id == message_id => break,
                Ok(ThreadEvent::Aborted { message_id: id }) if id == message_id => break,
                Ok(ThreadEvent::Failed { message_id: id, reason }) if id == message_id => {
                    println!();
                    eprintln!("[stream failed: {}]", reason);
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Display fell behind by {} events", skipped);
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                match conversation.streams().abort(&message_id).await {
                    Ok(outcome) if outcome.acknowledged => print!(" [aborted]"),
                    Ok(_) => print!(" [aborted locally; the backend did not confirm]"),
                    Err(e) => eprintln!("Abort failed: {}", e),
                }
                break;
            }
        }
    }

    // Final content may replace the deltas, and lag drops some of them.
    if let Some(message) = conversation.message(&message_id).await {
        let stored = message.content.as_text();
        match catch_up(&shown, &stored) {
            CatchUp::Done => {}
            CatchUp::Append(tail) => print!("{}", tail),
            CatchUp::Reprint(all) => print!("\nTeehee> {}", all),
        }
    }
    println!();

    match task.wait().await {
        Ok(_) | Err(ChatError::StreamFailed { .. }) => Ok(()),
        Err(e) if e.requires_reauth() => Err(e.into()),
        Err(e) => {
            eprintln!("Stream ended with an error: {}", e);
            Ok(())
        }
    }
}

/// What the terminal still needs so the reply on screen matches the store.
#[derive(Debug, PartialEq)]
enum CatchUp<'a> {
    Done,
    Append(&'a str),
    Reprint(&'a str),
}

fn catch_up<'a>(shown: &str, stored: &'a str) -> CatchUp<'a> {
    match stored.strip_prefix(shown) {
        Some("") => CatchUp::Done,
        Some(tail) => CatchUp::Append(tail),
        None => CatchUp::Reprint(stored),
    }
}
