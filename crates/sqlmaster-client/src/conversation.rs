//! Conversation log and chat entry model
//!
//! The log is the single ordered record the UI renders and exports. Entries are
//! immutable once appended; the only way to remove them is [`ConversationLog::clear`].

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// One result row: field name to value, in the column order the service sent.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Assistant entry appended when the service rejects the session token.
pub const SESSION_EXPIRED_NOTICE: &str =
    "Your session has expired. Please sign in again to keep asking questions.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum ChatEntry {
    User { content: String },
    Assistant(AssistantEntry),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssistantEntry {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_rows: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflection: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambiguity: Option<Ambiguity>,
}

/// Present when the service could not decide which source a question targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub candidate_sources: Vec<String>,
}

impl ChatEntry {
    pub fn user(content: impl Into<String>) -> Self {
        ChatEntry::User {
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatEntry::Assistant(AssistantEntry {
            content: content.into(),
            ..Default::default()
        })
    }

    pub fn role(&self) -> Role {
        match self {
            ChatEntry::User { .. } => Role::User,
            ChatEntry::Assistant(_) => Role::Assistant,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            ChatEntry::User { content } => content,
            ChatEntry::Assistant(entry) => &entry.content,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ChatEntry::Assistant(AssistantEntry { ambiguity: Some(_), .. }))
    }

    pub fn result_rows(&self) -> Option<&[Row]> {
        match self {
            ChatEntry::Assistant(entry) => entry.result_rows.as_deref(),
            ChatEntry::User { .. } => None,
        }
    }
}

impl AssistantEntry {
    /// Source names in first-seen order, duplicates and blanks dropped.
    pub fn with_candidates(content: impl Into<String>, candidates: Vec<String>) -> Self {
        let mut candidate_sources: Vec<String> = Vec::with_capacity(candidates.len());
        for name in candidates {
            let name = name.trim().to_string();
            if !name.is_empty() && !candidate_sources.contains(&name) {
                candidate_sources.push(name);
            }
        }
        Self {
            content: content.into(),
            ambiguity: Some(Ambiguity { candidate_sources }),
            ..Default::default()
        }
    }
}

/// Append-only, shareable chat history.
#[derive(Clone, Default)]
pub struct ConversationLog {
    entries: Arc<RwLock<Vec<ChatEntry>>>,
}

impl ConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends and returns the index the entry landed at.
    pub fn append(&self, entry: ChatEntry) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.push(entry);
        let index = entries.len() - 1;
        debug!("Conversation log append #{} ({})", index, entries[index].role().as_str());
        index
    }

    pub fn entries(&self) -> Vec<ChatEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, index: usize) -> Option<ChatEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).get(index).cloned()
    }

    pub fn last(&self) -> Option<ChatEntry> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).last().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rows of the most recent assistant entry that carried any.
    pub fn latest_rows(&self) -> Option<Vec<Row>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .rev()
            .find_map(|entry| entry.result_rows().filter(|rows| !rows.is_empty()))
            .map(|rows| rows.to_vec())
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        debug!("Clearing conversation log ({} entries)", entries.len());
        entries.clear();
    }
}
