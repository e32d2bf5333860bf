use std::collections::HashSet;
use tracing::{debug, info};

use crate::api::models::Message;
use crate::chat::store::MessageStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// The live message, when the server also reported it and local content
    /// was kept instead.
    pub kept_live: Option<String>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Merges an authoritative server thread into local state.
///
/// Server copies win, except for `live` (the message currently streaming
/// locally), which keeps its local copy until its stream ends. Server-only
/// messages are added. Local-only messages are removed unless they are
/// still waiting for their creation to round-trip (`pending`) or are live.
pub fn reconcile(
    store: &mut MessageStore,
    server: Vec<Message>,
    live: Option<&str>,
    pending: &HashSet<String>,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let server_ids: HashSet<String> = server.iter().map(|m| m.id.clone()).collect();

    for message in server {
        if Some(message.id.as_str()) == live {
            report.kept_live = Some(message.id);
            continue;
        }
        match store.get(&message.id) {
            Some(local) if *local == message => {}
            Some(_) => {
                report.updated.push(message.id.clone());
                store.replace(message);
            }
            None => {
                report.added.push(message.id.clone());
                store.append(message);
            }
        }
    }

    let mut stale: Vec<String> = store
        .ids()
        .into_iter()
        .filter(|id| !server_ids.contains(id))
        .filter(|id| !pending.contains(id))
        .filter(|id| Some(id.as_str()) != live)
        .collect();
    stale.sort();
    for id in stale {
        debug!("Dropping message {} the server no longer has", id);
        store.remove(&id);
        report.removed.push(id);
    }

    if !report.is_noop() {
        info!(
            "Reconciled thread: {} added, {} updated, {} removed",
            report.added.len(),
            report.updated.len(),
            report.removed.len()
        );
    }
    report
}
