//! IDE source reader: conversations from per-session chat documents.
//!
//! Each `.chat` document holds one session as a loosely-typed JSON record.
//! The document's parent directory name identifies the workspace, subject
//! to a decoding convention (see [`decode_workspace`]). Documents are
//! discovered by glob patterns whose non-glob prefix is the walk root.
//!
//! Failure semantics: a document that fails to parse is skipped with a
//! warning; missing directories are not errors.

use anyhow::Result;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

use crate::config::{expand_tilde, Config};
use crate::loader::parse_loose_timestamp;
use crate::models::{IndexedMessage, Role, SessionInfo, Source};

/// Discovered set of IDE chat documents.
pub struct IdeStore {
    files: Vec<PathBuf>,
}

impl IdeStore {
    /// Discover chat documents from the configured glob patterns.
    ///
    /// Patterns are tried in order; the first pattern with any matches
    /// wins (the patterns are per-OS install locations, so at most one
    /// matches on a given machine). Missing roots are not errors.
    pub fn discover(config: &Config) -> IdeStore {
        if !config.sources.ide.enabled {
            return IdeStore { files: Vec::new() };
        }
        for pattern in &config.sources.ide.patterns {
            match match_pattern(pattern) {
                Ok(files) if !files.is_empty() => return IdeStore { files },
                Ok(_) => {}
                Err(e) => warn!(pattern, error = %e, "Invalid IDE chat pattern"),
            }
        }
        IdeStore { files: Vec::new() }
    }

    /// List all IDE sessions from the discovered documents.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let Ok(meta) = std::fs::metadata(file) else {
                continue;
            };
            let session_id = file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let workspace = file
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| decode_workspace(&n.to_string_lossy()))
                .unwrap_or_default();

            sessions.push(SessionInfo {
                session_id,
                workspace,
                message_count: 0,
                created: meta.created().ok().map(DateTime::<Utc>::from),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
                source: Source::Ide,
            });
        }
        sessions
    }

    /// Load the ordered messages of one session's document.
    pub fn load_session_messages(&self, session: &SessionInfo) -> Vec<IndexedMessage> {
        let Some(file) = self.files.iter().find(|f| {
            f.file_stem()
                .map(|s| s.to_string_lossy().as_ref() == session.session_id)
                .unwrap_or(false)
        }) else {
            return Vec::new();
        };

        let data: Value = match std::fs::read_to_string(file)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
        {
            Ok(v) => v,
            Err(e) => {
                warn!(session = %session.session_id, error = %e, "Skipping malformed IDE chat document");
                return Vec::new();
            }
        };

        let msg_list = message_list(&data);
        let mut messages = Vec::new();

        for (idx, msg) in msg_list.iter().enumerate() {
            let Some(obj) = msg.as_object() else {
                continue;
            };

            let role_label = obj
                .get("role")
                .or_else(|| obj.get("type"))
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let Some(role) = Role::parse(role_label) else {
                continue;
            };

            let content = obj
                .get("content")
                .or_else(|| obj.get("text"))
                .or_else(|| obj.get("message"))
                .unwrap_or(&Value::Null);
            let text = extract_text(content);

            // Embedded system prompts (identity, capabilities) arrive as
            // user turns and would pollute every search.
            if role == Role::User && text.starts_with("<identity>") {
                continue;
            }
            if text.trim().is_empty() {
                continue;
            }

            let timestamp = obj
                .get("timestamp")
                .or_else(|| obj.get("created_at"))
                .and_then(parse_loose_timestamp)
                .or(session.modified)
                .or(session.created)
                .unwrap_or_else(Utc::now);

            let uuid = obj
                .get("id")
                .or_else(|| obj.get("uuid"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{}-{}", session.session_id, idx));

            messages.push(IndexedMessage {
                uuid,
                session_id: session.session_id.clone(),
                workspace: session.workspace.clone(),
                timestamp,
                role,
                content: text,
                ordinal: idx,
                source: Source::Ide,
                content_hash: String::new(),
            });
        }
        messages
    }
}

/// Locate the turn list inside a loosely-typed chat document.
///
/// Known layouts, in order: `{"chat": […]}`, `{"messages": […]}`,
/// `{"history": […]}`, `{"conversation": {"messages": […]}}`, and a bare
/// top-level array.
fn message_list(data: &Value) -> Vec<Value> {
    for key in ["chat", "messages", "history"] {
        if let Some(list) = data.get(key).and_then(|v| v.as_array()) {
            if !list.is_empty() {
                return list.clone();
            }
        }
    }
    if let Some(list) = data
        .get("conversation")
        .and_then(|c| c.get("messages"))
        .and_then(|v| v.as_array())
    {
        if !list.is_empty() {
            return list.clone();
        }
    }
    if let Some(list) = data.as_array() {
        return list.clone();
    }
    Vec::new()
}

/// Flatten loosely-typed IDE turn content to searchable text.
fn extract_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("text")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_default(),
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

/// Decode an encoded workspace directory name back to a path.
///
/// Directory names that percent-decode to an absolute path are decoded;
/// anything else (opaque workspace hashes) is kept verbatim.
pub fn decode_workspace(dir_name: &str) -> String {
    let decoded = percent_decode(dir_name);
    if decoded != dir_name && looks_like_absolute_path(&decoded) {
        decoded
    } else {
        dir_name.to_string()
    }
}

fn looks_like_absolute_path(s: &str) -> bool {
    if s.starts_with('/') {
        return true;
    }
    // Windows drive prefix, e.g. "C:\" or "C:/".
    let bytes = s.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = &s[i + 1..i + 3];
            if let Ok(b) = u8::from_str_radix(hex, 16) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
}

/// Resolve one glob pattern to its matching files.
///
/// The non-glob prefix of the pattern is the walk root; the remainder is
/// compiled into a [`GlobSet`] matched against paths relative to it.
fn match_pattern(pattern: &str) -> Result<Vec<PathBuf>> {
    let expanded = expand_tilde(pattern);
    let (root, glob) = split_glob(&expanded);
    if !root.exists() {
        return Ok(Vec::new());
    }
    let Some(glob) = glob else {
        // No glob component: the pattern names a single file.
        return Ok(if expanded.is_file() { vec![expanded] } else { Vec::new() });
    };

    let matcher = build_globset(&glob)?;
    let mut files = Vec::new();
    for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
        if matcher.is_match(relative.to_string_lossy().as_ref()) {
            files.push(entry.path().to_path_buf());
        }
    }
    // Sort for deterministic ordering.
    files.sort();
    Ok(files)
}

/// Split an expanded pattern into (non-glob root, glob remainder).
fn split_glob(pattern: &Path) -> (PathBuf, Option<String>) {
    let mut root = PathBuf::new();
    let mut glob_parts: Vec<String> = Vec::new();
    for part in pattern.components() {
        let text = part.as_os_str().to_string_lossy();
        if !glob_parts.is_empty() || text.contains('*') || text.contains('?') || text.contains('[')
        {
            glob_parts.push(text.to_string());
        } else {
            root.push(part);
        }
    }
    if glob_parts.is_empty() {
        (root, None)
    } else {
        (root, Some(glob_parts.join("/")))
    }
}

fn build_globset(pattern: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(pattern)?);
    Ok(builder.build()?)
}
