//! CLI source reader: conversations from the CLI's SQLite store.
//!
//! The store holds one row per session in `conversations_v2`, keyed by
//! workspace path and conversation id, with the full turn history
//! serialised as a JSON document in the `value` column. Turn content is
//! loosely typed (plain strings, prompt wrappers, or lists of text parts)
//! and is flattened to searchable text here.
//!
//! Failure semantics: a malformed row is skipped with a warning; an
//! unreachable database is fatal for this source only (the unified loader
//! logs it and continues with the IDE source).

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tracing::warn;

use crate::config::Config;
use crate::loader::parse_loose_timestamp;
use crate::models::{IndexedMessage, Role, SessionInfo, Source};

/// Read-only handle to the CLI conversation store.
pub struct CliStore {
    pool: SqlitePool,
}

impl CliStore {
    /// Open the first configured database path that exists.
    ///
    /// Returns `Ok(None)` when the source is disabled or no database is
    /// present — an absent store is not an error.
    pub async fn open(config: &Config) -> Result<Option<CliStore>> {
        if !config.sources.cli.enabled {
            return Ok(None);
        }
        let Some(db_path) = config.sources.cli.database_path() else {
            return Ok(None);
        };
        let pool = connect_readonly(&db_path)
            .await
            .with_context(|| format!("Failed to open CLI store: {}", db_path.display()))?;
        Ok(Some(CliStore { pool }))
    }

    /// List all CLI sessions without reading message bodies.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let rows = sqlx::query(
            "SELECT key, conversation_id, created_at, updated_at FROM conversations_v2",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to read CLI session listing")?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in &rows {
            let workspace: String = match row.try_get("key") {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Skipping CLI session row with unreadable key");
                    continue;
                }
            };
            let session_id: String = match row.try_get("conversation_id") {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Skipping CLI session row with unreadable id");
                    continue;
                }
            };
            sessions.push(SessionInfo {
                session_id,
                workspace,
                message_count: 0,
                created: column_timestamp(row, "created_at"),
                modified: column_timestamp(row, "updated_at"),
                source: Source::Cli,
            });
        }
        Ok(sessions)
    }

    /// Load the ordered messages of one session.
    ///
    /// Returns an empty list when the row is missing or its JSON document
    /// cannot be decoded (skipped with a warning, per the loader contract).
    pub async fn load_session_messages(&self, session: &SessionInfo) -> Result<Vec<IndexedMessage>> {
        let row = sqlx::query(
            "SELECT value FROM conversations_v2 WHERE key = ? AND conversation_id = ?",
        )
        .bind(&session.workspace)
        .bind(&session.session_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(Vec::new());
        };
        let raw: String = match row.try_get("value") {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "Skipping CLI session with unreadable value");
                return Ok(Vec::new());
            }
        };
        let data: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "Skipping malformed CLI session document");
                return Ok(Vec::new());
            }
        };

        let history = data
            .get("history")
            .and_then(|h| h.as_array())
            .cloned()
            .unwrap_or_default();

        let mut messages = Vec::new();
        for (turn, entry) in history.iter().enumerate() {
            // Each history entry can carry a user turn, an assistant turn, or both.
            for role in [Role::User, Role::Assistant] {
                let Some(msg_data) = entry.get(role.as_str()) else {
                    continue;
                };
                let text = extract_text(msg_data.get("content").unwrap_or(&Value::Null));
                if text.trim().is_empty() {
                    continue;
                }

                let timestamp = msg_data
                    .get("timestamp")
                    .and_then(parse_loose_timestamp)
                    .or(session.created)
                    .or(session.modified)
                    .unwrap_or_else(chrono::Utc::now);

                messages.push(IndexedMessage {
                    uuid: format!("{}-{}-{}", session.session_id, turn, role),
                    session_id: session.session_id.clone(),
                    workspace: session.workspace.clone(),
                    timestamp,
                    role,
                    content: text,
                    ordinal: messages.len(),
                    source: Source::Cli,
                    content_hash: String::new(),
                });
            }
        }
        Ok(messages)
    }
}

async fn connect_readonly(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Read a timestamp column that may hold Unix milliseconds or an ISO string.
fn column_timestamp(row: &SqliteRow, col: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    if let Ok(ms) = row.try_get::<i64, _>(col) {
        return parse_loose_timestamp(&Value::from(ms));
    }
    if let Ok(s) = row.try_get::<String, _>(col) {
        return parse_loose_timestamp(&Value::from(s));
    }
    None
}

/// Flatten a loosely-typed turn content value to searchable text.
///
/// Handles the shapes observed in the store: plain strings,
/// `{"Prompt": {"prompt": …}}`, `{"text": …}`, `{"prompt": …}`, and
/// lists of text parts.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            if let Some(p) = map
                .get("Prompt")
                .and_then(|p| p.get("prompt"))
                .and_then(|v| v.as_str())
            {
                return p.to_string();
            }
            if let Some(t) = map.get("text").and_then(|v| v.as_str()) {
                return t.to_string();
            }
            if let Some(t) = map.get("prompt").and_then(|v| v.as_str()) {
                return t.to_string();
            }
            String::new()
        }
        Value::Array(items) => {
            let mut parts = Vec::new();
            for item in items {
                match item {
                    Value::String(s) => parts.push(s.clone()),
                    Value::Object(map) => {
                        let is_text = map.get("type").and_then(|t| t.as_str()) == Some("text")
                            || map.contains_key("text");
                        if is_text {
                            if let Some(t) = map.get("text").and_then(|v| v.as_str()) {
                                parts.push(t.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            parts.join("\n")
        }
        _ => String::new(),
    }
}
