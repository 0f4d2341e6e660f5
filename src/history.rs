//! Per-user conversation history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Longest message kept in history, in characters.
pub const MAX_MESSAGE_CHARS: usize = 1500;

/// Entries retained per user by the in-memory store.
const MAX_ENTRIES_PER_USER: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    User,
    System,
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User => write!(f, "user"),
            Actor::System => write!(f, "system"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: Actor,
    pub message_type: String,
    pub message: String,
}

impl HistoryEntry {
    pub fn new(actor: Actor, message_type: impl Into<String>, message: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            actor,
            message_type: message_type.into(),
            message: trim_message(message),
        }
    }

    pub fn user(message_type: impl Into<String>, message: &str) -> Self {
        Self::new(Actor::User, message_type, message)
    }

    pub fn system(message_type: impl Into<String>, message: &str) -> Self {
        Self::new(Actor::System, message_type, message)
    }
}

/// Cut `message` to `MAX_MESSAGE_CHARS` characters, marking the cut with `...`.
pub fn trim_message(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((cut, _)) => format!("{}...", &message[..cut]),
        None => message.to_string(),
    }
}

/// Render entries as the text block embedded in the planner prompt.
pub fn render(entries: &[HistoryEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{} ({}): {}", e.actor, e.message_type, e.message))
        .collect::<Vec<_>>()
        .join("\n")
}

#[async_trait]
pub trait ConversationHistory: Send + Sync {
    async fn append(&self, user_id: &str, entry: HistoryEntry);

    /// Up to `limit` most recent entries, oldest first.
    async fn recent(&self, user_id: &str, limit: usize) -> Vec<HistoryEntry>;

    async fn clear(&self, user_id: &str);
}

/// Process-local history store.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHistory {
    entries: Arc<RwLock<HashMap<String, VecDeque<HistoryEntry>>>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationHistory for InMemoryHistory {
    async fn append(&self, user_id: &str, entry: HistoryEntry) {
        let mut entries = self.entries.write().await;
        let log = entries.entry(user_id.to_string()).or_default();
        log.push_back(entry);
        while log.len() > MAX_ENTRIES_PER_USER {
            log.pop_front();
        }
    }

    async fn recent(&self, user_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.read().await;
        entries
            .get(user_id)
            .map(|log| log.iter().skip(log.len().saturating_sub(limit)).cloned().collect())
            .unwrap_or_default()
    }

    async fn clear(&self, user_id: &str) {
        if self.entries.write().await.remove(user_id).is_some() {
            tracing::info!(user_id = %user_id, "Cleared conversation history");
        }
    }
}
