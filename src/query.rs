//! Query engine: scoped cosine-similarity search over the index snapshot.
//!
//! A search validates its arguments, obtains the current snapshot,
//! embeds the query once, scores every candidate with a dot product
//! (both sides are unit-norm, so the dot product *is* the cosine),
//! deduplicates on `(content_hash, role)`, paginates, and assembles a
//! context window around each hit.

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashSet;

use crate::embedding::dot;
use crate::index::{RecallIndex, Snapshot};
use crate::models::{
    ContextMessage, MatchedMessage, Role, SearchResponse, SearchResult, Source,
};

/// Result content is clipped to keep tool responses bounded.
const MAX_CONTENT_LENGTH: usize = 2000;

/// One search invocation.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    /// Exact workspace path to scope to.
    pub workspace: Option<String>,
    /// Restrict to one source; `None` searches both.
    pub source: Option<Source>,
    /// ISO 8601; messages at or after this instant (inclusive).
    pub after: Option<String>,
    /// ISO 8601; messages strictly before this instant (exclusive).
    pub before: Option<String>,
    pub context_size: usize,
    pub threshold: f32,
    pub max_results: usize,
    pub offset: usize,
}

impl SearchParams {
    /// Parameters with configured defaults for the given query.
    pub fn new(query: &str, config: &crate::config::Config) -> SearchParams {
        SearchParams {
            query: query.to_string(),
            workspace: None,
            source: None,
            after: None,
            before: None,
            context_size: config.search.default_context_window,
            threshold: config.search.default_threshold,
            max_results: config.search.default_max_results,
            offset: 0,
        }
    }
}

/// Search conversations with filters and pagination.
pub async fn search_conversations(
    index: &RecallIndex,
    params: &SearchParams,
) -> Result<SearchResponse> {
    if params.query.trim().is_empty() {
        bail!("query must not be empty");
    }
    if !(0.0..=1.0).contains(&params.threshold) {
        bail!("threshold must be in [0.0, 1.0]");
    }
    if params.max_results < 1 {
        bail!("max_results must be >= 1");
    }
    let after = parse_date_filter(params.after.as_deref())?;
    let before = parse_date_filter(params.before.as_deref())?;

    let snapshot = index.snapshot().await?;
    if snapshot.is_empty() {
        return Ok(empty_response(params, &snapshot));
    }

    let query_vec = index.embed_query(&params.query).await?;

    // Filter mask and scoring in one pass over the snapshot.
    let mut hits: Vec<(usize, f32)> = Vec::new();
    for (idx, msg) in snapshot.messages.iter().enumerate() {
        if let Some(after) = after {
            if msg.timestamp < after {
                continue;
            }
        }
        if let Some(before) = before {
            if msg.timestamp >= before {
                continue;
            }
        }
        if let Some(workspace) = &params.workspace {
            if &msg.workspace != workspace {
                continue;
            }
        }
        if let Some(source) = params.source {
            if msg.source != source {
                continue;
            }
        }

        let score = dot(&query_vec, snapshot.vector(idx));
        if score >= params.threshold {
            hits.push((idx, score));
        }
    }

    // Deterministic order: score desc, newer first, then identity.
    hits.sort_by(|&(a_idx, a_score), &(b_idx, b_score)| {
        let a = &snapshot.messages[a_idx];
        let b = &snapshot.messages[b_idx];
        b_score
            .partial_cmp(&a_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.timestamp.cmp(&a.timestamp))
            .then_with(|| a.source.as_str().cmp(b.source.as_str()))
            .then_with(|| a.session_id.cmp(&b.session_id))
            .then_with(|| a.uuid.cmp(&b.uuid))
    });

    // Suppress later hits that repeat an earlier (content_hash, role).
    let mut seen: HashSet<(&str, Role)> = HashSet::new();
    let mut deduplicated: Vec<(usize, f32)> = Vec::new();
    for (idx, score) in hits {
        let msg = &snapshot.messages[idx];
        if seen.insert((msg.content_hash.as_str(), msg.role)) {
            deduplicated.push((idx, score));
        }
    }

    let total = deduplicated.len();
    let page: Vec<(usize, f32)> = deduplicated
        .into_iter()
        .skip(params.offset)
        .take(params.max_results)
        .collect();

    let mut results = Vec::with_capacity(page.len());
    for (idx, score) in page {
        let msg = &snapshot.messages[idx];
        results.push(SearchResult {
            matched_message: MatchedMessage {
                role: msg.role,
                content: truncate(&msg.content),
                timestamp: msg.timestamp,
                workspace: msg.workspace.clone(),
                session_id: msg.session_id.clone(),
                uuid: msg.uuid.clone(),
                source: msg.source,
            },
            score: round_score(score),
            context: context_window(&snapshot, idx, params.context_size),
        });
    }

    let has_more = params.offset + results.len() < total;
    let count = results.len();
    Ok(SearchResponse {
        results,
        query: params.query.clone(),
        total_matches: total,
        offset: params.offset,
        has_more,
        excluded_sessions: snapshot.excluded_sessions,
        hint: generate_hint(total, params.offset, count, params.max_results, has_more),
    })
}

/// Messages around a match, clipped to the session boundary.
fn context_window(snapshot: &Snapshot, matched_idx: usize, context_size: usize) -> Vec<ContextMessage> {
    let msg = &snapshot.messages[matched_idx];
    let indices = snapshot.session_indices(&msg.session_key());
    let Some(pos) = indices.iter().position(|&i| i == matched_idx) else {
        return vec![ContextMessage {
            role: msg.role,
            content: truncate(&msg.content),
            timestamp: msg.timestamp,
            is_match: true,
        }];
    };

    let start = pos.saturating_sub(context_size);
    let end = (pos + context_size + 1).min(indices.len());

    indices[start..end]
        .iter()
        .map(|&i| {
            let m = &snapshot.messages[i];
            ContextMessage {
                role: m.role,
                content: truncate(&m.content),
                timestamp: m.timestamp,
                is_match: i == matched_idx,
            }
        })
        .collect()
}

fn empty_response(params: &SearchParams, snapshot: &Snapshot) -> SearchResponse {
    SearchResponse {
        results: Vec::new(),
        query: params.query.clone(),
        total_matches: 0,
        offset: 0,
        has_more: false,
        excluded_sessions: snapshot.excluded_sessions,
        hint: generate_hint(0, 0, 0, params.max_results, false),
    }
}

/// Parse an ISO 8601 date filter: a bare date means midnight UTC.
pub fn parse_date_filter(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = value else {
        return Ok(None);
    };

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(Some(date.and_hms_opt(0, 0, 0).unwrap().and_utc()));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(Some(naive.and_utc()));
    }
    bail!("Invalid date format: {value}. Use ISO 8601 (e.g., 2025-01-15)")
}

fn truncate(content: &str) -> String {
    if content.chars().count() <= MAX_CONTENT_LENGTH {
        return content.to_string();
    }
    let clipped: String = content.chars().take(MAX_CONTENT_LENGTH - 3).collect();
    format!("{clipped}...")
}

fn round_score(score: f32) -> f32 {
    (score * 10_000.0).round() / 10_000.0
}

fn generate_hint(
    total: usize,
    offset: usize,
    count: usize,
    max_results: usize,
    has_more: bool,
) -> String {
    if total == 0 {
        return "No matches found. Try different search terms.".to_string();
    }

    let (start, end) = (offset + 1, offset + count);
    if has_more {
        return format!(
            "Showing {start}-{end} of {total}. Use offset: {} for more.",
            offset + max_results
        );
    }
    if start == 1 {
        return format!("Showing all {total} matches.");
    }
    format!("Showing {start}-{end} of {total} (final page).")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date_filter_bare_date_is_midnight() {
        let dt = parse_date_filter(Some("2025-01-15")).unwrap().unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-01-15T00:00:00+00:00");
    }

    #[test]
    fn test_parse_date_filter_full_datetime() {
        let dt = parse_date_filter(Some("2025-01-15T10:30:00Z")).unwrap().unwrap();
        assert_eq!(dt.timestamp(), 1736937000);
        assert!(parse_date_filter(None).unwrap().is_none());
    }

    #[test]
    fn test_parse_date_filter_rejects_garbage() {
        assert!(parse_date_filter(Some("last tuesday")).is_err());
        assert!(parse_date_filter(Some("2025-13-40")).is_err());
    }

    #[test]
    fn test_truncate_clips_long_content() {
        let short = "short message";
        assert_eq!(truncate(short), short);

        let long = "x".repeat(MAX_CONTENT_LENGTH + 100);
        let clipped = truncate(&long);
        assert_eq!(clipped.chars().count(), MAX_CONTENT_LENGTH);
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn test_hint_wording() {
        assert_eq!(
            generate_hint(0, 0, 0, 10, false),
            "No matches found. Try different search terms."
        );
        assert_eq!(
            generate_hint(25, 0, 10, 10, true),
            "Showing 1-10 of 25. Use offset: 10 for more."
        );
        assert_eq!(generate_hint(5, 0, 5, 10, false), "Showing all 5 matches.");
        assert_eq!(
            generate_hint(25, 20, 5, 10, false),
            "Showing 21-25 of 25 (final page)."
        );
    }

    #[test]
    fn test_round_score() {
        assert_eq!(round_score(0.123456), 0.1235);
        assert_eq!(round_score(1.0), 1.0);
    }
}
