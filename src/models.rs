//! Core data models used throughout Total Recall.
//!
//! These types represent the messages, sessions, and search results that
//! flow through the loading and retrieval pipeline. The data lifecycle is:
//!
//! ```text
//! Source reader → IndexedMessage → loader (sort + hash) → index (embed)
//!                                                            ↓
//!                                                  search() → SearchResult
//! ```
//!
//! # Type Relationships
//!
//! - A **[`SessionInfo`]** is a lightweight session listing produced by a
//!   source reader before any message bodies are read.
//! - An **[`IndexedMessage`]** is the atomic indexed unit: one turn of a
//!   conversation, normalized from either store.
//! - A **[`SearchResult`]** pairs a matched message with its score and the
//!   surrounding context window; **[`SearchResponse`]** is the full tool
//!   response with pagination metadata.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which on-disk store a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The CLI's relational conversation store.
    Cli,
    /// The IDE's per-session chat documents.
    Ide,
}

impl Source {
    /// Stable label used in session keys and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Cli => "cli",
            Source::Ide => "ide",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversational role of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }

    /// Parse the loose role labels that appear in source documents.
    ///
    /// IDE documents use `human`/`ai` in older formats; unknown labels
    /// return `None` and the message is skipped.
    pub fn parse(label: &str) -> Option<Role> {
        match label {
            "user" | "human" => Some(Role::User),
            "assistant" | "ai" => Some(Role::Assistant),
            "system" => Some(Role::System),
            "tool" => Some(Role::Tool),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message normalized for indexing.
///
/// | Field | Description |
/// |-------|-------------|
/// | `uuid` | Stable identifier within the session; synthesised from `(session_id, ordinal)` when the source has none |
/// | `session_id` | Stable identifier within `(source, store-location)` |
/// | `workspace` | Absolute project path; may be empty for CLI sessions that lack one |
/// | `timestamp` | Always present; filled from the session's best-known time when the turn has none |
/// | `ordinal` | Position within the session; authoritative for context-window order |
/// | `content_hash` | SHA-256 hex of `content`; the embedding cache key |
#[derive(Debug, Clone)]
pub struct IndexedMessage {
    pub uuid: String,
    pub session_id: String,
    pub workspace: String,
    pub timestamp: DateTime<Utc>,
    pub role: Role,
    pub content: String,
    /// Zero-based position within the session.
    pub ordinal: usize,
    pub source: Source,
    /// SHA-256 hex digest of `content`. Filled in by the unified loader.
    pub content_hash: String,
}

impl IndexedMessage {
    /// Key identifying the enclosing session across both sources.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.source, self.session_id)
    }
}

/// Metadata about a conversation session, listed before messages are read.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub workspace: String,
    pub message_count: usize,
    pub created: Option<DateTime<Utc>>,
    pub modified: Option<DateTime<Utc>>,
    pub source: Source,
}

impl SessionInfo {
    /// Best-known timestamp for ordering, falling back to the epoch.
    pub fn timestamp_fallback(&self) -> DateTime<Utc> {
        self.modified
            .or(self.created)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Key identifying this session across both sources.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.source, self.session_id)
    }
}

/// A message that matched a search query.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub workspace: String,
    pub session_id: String,
    pub uuid: String,
    pub source: Source,
}

/// A message in the context window around a match.
#[derive(Debug, Clone, Serialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub is_match: bool,
}

/// A search result with its surrounding context window.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub matched_message: MatchedMessage,
    pub score: f32,
    pub context: Vec<ContextMessage>,
}

/// Response from the search tools.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
    /// Count after deduplication, before pagination.
    pub total_matches: usize,
    pub offset: usize,
    pub has_more: bool,
    /// Sessions excluded by the memory budget (oldest first).
    pub excluded_sessions: usize,
    pub hint: String,
}
