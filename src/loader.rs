//! Unified loader: merges both conversation sources into one canonical,
//! deterministically ordered message list.
//!
//! The loader owns the cross-source invariants: global sort order
//! `(timestamp, source, session_id, ordinal)`, content hashing, session
//! fingerprints, and the drop rules for empty or oversized content. A
//! source that is unavailable is logged and skipped; the other source
//! still proceeds.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

use crate::config::Config;
use crate::models::{IndexedMessage, SessionInfo, Source};
use crate::source_cli::CliStore;
use crate::source_ide::IdeStore;

/// The loaded corpus handed to the embedding index.
pub struct LoadedCorpus {
    /// All kept messages, sorted by `(timestamp, source, session_id, ordinal)`.
    pub messages: Vec<IndexedMessage>,
    /// Fingerprint per loaded session key (`"{source}:{session_id}"`).
    pub fingerprints: HashMap<String, String>,
}

pub struct Loader {
    config: Arc<Config>,
}

impl Loader {
    pub fn new(config: Arc<Config>) -> Loader {
        Loader { config }
    }

    /// List sessions from both enabled sources, newest first.
    ///
    /// An unreachable CLI database is fatal for that source only.
    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::new();

        match CliStore::open(&self.config).await {
            Ok(Some(store)) => match store.list_sessions().await {
                Ok(cli_sessions) => sessions.extend(cli_sessions),
                Err(e) => warn!(error = %e, "CLI source unavailable, continuing without it"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "CLI source unavailable, continuing without it"),
        }

        let ide = IdeStore::discover(&self.config);
        sessions.extend(ide.list_sessions());

        sessions.sort_by(|a, b| b.timestamp_fallback().cmp(&a.timestamp_fallback()));
        sessions
    }

    /// Cheap digest over a session listing.
    ///
    /// Comparing two digests answers "did anything change at all?" without
    /// reading a single message body. Sorted so listing order is irrelevant.
    pub fn sessions_digest(sessions: &[SessionInfo]) -> String {
        let mut parts: Vec<String> = sessions
            .iter()
            .map(|s| {
                format!(
                    "{}:{}",
                    s.session_key(),
                    s.timestamp_fallback().timestamp_millis()
                )
            })
            .collect();
        parts.sort();

        let mut hasher = Sha256::new();
        hasher.update(parts.join("\n").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Load and normalize messages for the given sessions.
    ///
    /// Fills content hashes, drops empty and oversized content, computes
    /// per-session fingerprints, and sorts the merged list globally.
    pub async fn load_messages(&self, sessions: &[SessionInfo]) -> LoadedCorpus {
        let max_len = self.config.embedding.max_content_length;

        let cli_store = if sessions.iter().any(|s| s.source == Source::Cli) {
            match CliStore::open(&self.config).await {
                Ok(store) => store,
                Err(e) => {
                    warn!(error = %e, "CLI source unavailable, continuing without it");
                    None
                }
            }
        } else {
            None
        };
        let ide_store = if sessions.iter().any(|s| s.source == Source::Ide) {
            Some(IdeStore::discover(&self.config))
        } else {
            None
        };

        let mut messages = Vec::new();
        let mut fingerprints = HashMap::new();

        for session in sessions {
            let mut session_messages = match session.source {
                Source::Cli => match &cli_store {
                    Some(store) => match store.load_session_messages(session).await {
                        Ok(msgs) => msgs,
                        Err(e) => {
                            warn!(session = %session.session_id, error = %e, "Skipping unreadable CLI session");
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                },
                Source::Ide => match &ide_store {
                    Some(store) => store.load_session_messages(session),
                    None => Vec::new(),
                },
            };

            session_messages.retain(|m| {
                !m.content.trim().is_empty() && m.content.chars().count() <= max_len
            });
            for msg in &mut session_messages {
                msg.content_hash = content_hash(&msg.content);
            }

            fingerprints.insert(
                session.session_key(),
                session_fingerprint(&session.session_id, &session_messages),
            );
            messages.extend(session_messages);
        }

        messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.source.as_str().cmp(b.source.as_str()))
                .then_with(|| a.session_id.cmp(&b.session_id))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });

        LoadedCorpus {
            messages,
            fingerprints,
        }
    }
}

/// SHA-256 hex digest of a message's content: the embedding cache key.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Session fingerprint: detects session-level change without comparing
/// every message body on subsequent refreshes.
///
/// Covers `(session_id, message_count, last_timestamp, last content hash)`,
/// so appends, edits to the tail, and truncations all change it.
pub fn session_fingerprint(session_id: &str, messages: &[IndexedMessage]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(messages.len().to_le_bytes());
    if let Some(last) = messages.iter().max_by_key(|m| m.ordinal) {
        hasher.update(last.timestamp.timestamp_millis().to_le_bytes());
        hasher.update(last.content_hash.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Parse a timestamp that may be Unix milliseconds or an ISO 8601 string.
pub(crate) fn parse_loose_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let ms = n.as_i64()?;
            DateTime::from_timestamp_millis(ms)
        }
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            // Naive datetime, no offset.
            chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                .ok()
                .map(|naive| naive.and_utc())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;

    fn message(
        session_id: &str,
        ordinal: usize,
        ts_secs: i64,
        source: Source,
        content: &str,
    ) -> IndexedMessage {
        IndexedMessage {
            uuid: format!("{session_id}-{ordinal}"),
            session_id: session_id.to_string(),
            workspace: "/w".to_string(),
            timestamp: DateTime::from_timestamp(ts_secs, 0).unwrap(),
            role: Role::User,
            content: content.to_string(),
            ordinal,
            source,
            content_hash: content_hash(content),
        }
    }

    #[test]
    fn test_content_hash_stable_and_distinct() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        // SHA-256 hex: 64 chars.
        assert_eq!(content_hash("abc").len(), 64);
    }

    #[test]
    fn test_parse_loose_timestamp_formats() {
        let from_ms = parse_loose_timestamp(&json!(1736899200000_i64)).unwrap();
        assert_eq!(from_ms.timestamp(), 1736899200);

        let from_iso = parse_loose_timestamp(&json!("2025-01-15T00:00:00Z")).unwrap();
        assert_eq!(from_iso.timestamp(), 1736899200);

        let from_naive = parse_loose_timestamp(&json!("2025-01-15T00:00:00")).unwrap();
        assert_eq!(from_naive, from_iso);

        assert!(parse_loose_timestamp(&json!("yesterday")).is_none());
        assert!(parse_loose_timestamp(&Value::Null).is_none());
    }

    #[test]
    fn test_fingerprint_changes_with_tail() {
        let base = vec![
            message("s", 0, 100, Source::Cli, "first"),
            message("s", 1, 200, Source::Cli, "second"),
        ];
        let fp = session_fingerprint("s", &base);
        assert_eq!(fp, session_fingerprint("s", &base));

        let mut appended = base.clone();
        appended.push(message("s", 2, 300, Source::Cli, "third"));
        assert_ne!(fp, session_fingerprint("s", &appended));

        let mut edited = base.clone();
        edited[1].content_hash = content_hash("edited");
        assert_ne!(fp, session_fingerprint("s", &edited));

        assert_ne!(fp, session_fingerprint("other", &base));
    }

    #[test]
    fn test_sessions_digest_order_independent() {
        let a = SessionInfo {
            session_id: "a".to_string(),
            workspace: String::new(),
            message_count: 0,
            created: None,
            modified: DateTime::from_timestamp(100, 0),
            source: Source::Cli,
        };
        let b = SessionInfo {
            session_id: "b".to_string(),
            source: Source::Ide,
            ..a.clone()
        };
        let d1 = Loader::sessions_digest(&[a.clone(), b.clone()]);
        let d2 = Loader::sessions_digest(&[b.clone(), a.clone()]);
        assert_eq!(d1, d2);

        let mut touched = a.clone();
        touched.modified = DateTime::from_timestamp(200, 0);
        assert_ne!(d1, Loader::sessions_digest(&[touched, b]));
    }

    #[test]
    fn test_global_sort_order() {
        let mut messages = vec![
            message("s2", 0, 200, Source::Ide, "c"),
            message("s1", 1, 100, Source::Cli, "b"),
            message("s1", 0, 100, Source::Cli, "a"),
            message("s1", 0, 100, Source::Ide, "d"),
        ];
        messages.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.source.as_str().cmp(b.source.as_str()))
                .then_with(|| a.session_id.cmp(&b.session_id))
                .then_with(|| a.ordinal.cmp(&b.ordinal))
        });
        let order: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "d", "c"]);
    }
}
