//! End-to-end scenarios over fixture corpora.
//!
//! Each test builds an isolated index over a temporary CLI SQLite store
//! and/or IDE chat documents, using a deterministic stub embedder: every
//! text maps to a fixed unit vector with a shared bias component, so
//! identical texts score 1.0 against each other, distinct texts score
//! well below 1.0 but above 0.0, and everything is reproducible.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tempfile::TempDir;

use total_recall::config::Config;
use total_recall::embedding::{normalize_l2, Embedder};
use total_recall::models::Source;
use total_recall::query::{search_conversations, SearchParams};
use total_recall::tools::{Tool, ToolContext, ToolRegistry};
use total_recall::RecallIndex;

const DIMS: usize = 384;

/// Deterministic embedder: unit vectors with a large shared bias, noise
/// derived from a stable hash of the text. Counts every embedded text so
/// tests can assert incremental behavior.
struct StubEmbedder {
    texts_embedded: AtomicUsize,
    fail: AtomicBool,
}

impl StubEmbedder {
    fn new() -> StubEmbedder {
        StubEmbedder {
            texts_embedded: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }

    fn embedded_count(&self) -> usize {
        self.texts_embedded.load(Ordering::SeqCst)
    }

    fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

impl Embedder for StubEmbedder {
    fn model_id(&self) -> &str {
        "stub-embedder"
    }

    fn dims(&self) -> usize {
        DIMS
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("stub embedder offline");
        }
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| stub_vector(t)).collect())
    }
}

fn stub_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[0] = 10.0;
    for (i, slot) in v.iter_mut().enumerate().skip(1) {
        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        i.hash(&mut hasher);
        *slot = (hasher.finish() % 2000) as f32 / 1000.0 - 1.0;
    }
    normalize_l2(v)
}

fn make_config(root: &Path) -> Arc<Config> {
    let mut config = Config::default();
    config.sources.cli.paths = vec![root.join("cli.sqlite3").display().to_string()];
    config.sources.ide.patterns = vec![format!("{}/chats/*/*.chat", root.display())];
    config.embedding.cache_dir = root.join("cache").display().to_string();
    // A fixed large limit keeps tests independent of the host's RAM.
    config.memory.limit_mb = Some(4096);
    Arc::new(config)
}

fn make_index(config: Arc<Config>) -> (Arc<RecallIndex>, Arc<StubEmbedder>) {
    let embedder = Arc::new(StubEmbedder::new());
    let index = Arc::new(RecallIndex::new(config, embedder.clone()));
    (index, embedder)
}

async fn open_store(db_path: &Path) -> SqlitePool {
    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))
        .unwrap()
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS conversations_v2 (\
         key TEXT NOT NULL, conversation_id TEXT NOT NULL, value TEXT NOT NULL, \
         created_at INTEGER, updated_at INTEGER, PRIMARY KEY (key, conversation_id))",
    )
    .execute(&pool)
    .await
    .unwrap();
    pool
}

/// One history entry per turn: `(role, text, timestamp_millis)`.
fn cli_session_value(turns: &[(&str, &str, i64)]) -> String {
    let history: Vec<Value> = turns
        .iter()
        .map(|(role, text, ts)| json!({ *role: {"content": text, "timestamp": ts} }))
        .collect();
    json!({ "history": history }).to_string()
}

async fn insert_cli_session(
    pool: &SqlitePool,
    workspace: &str,
    session_id: &str,
    updated_ms: i64,
    turns: &[(&str, &str, i64)],
) {
    sqlx::query(
        "INSERT OR REPLACE INTO conversations_v2 (key, conversation_id, value, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(workspace)
    .bind(session_id)
    .bind(cli_session_value(turns))
    .bind(turns.first().map(|t| t.2).unwrap_or(updated_ms))
    .bind(updated_ms)
    .execute(pool)
    .await
    .unwrap();
}

fn write_chat_document(
    root: &Path,
    workspace_dir: &str,
    session_id: &str,
    turns: &[(&str, &str, i64)],
) {
    let dir = root.join("chats").join(workspace_dir);
    std::fs::create_dir_all(&dir).unwrap();
    let messages: Vec<Value> = turns
        .iter()
        .map(|(role, text, ts)| json!({"role": role, "content": text, "timestamp": ts}))
        .collect();
    std::fs::write(
        dir.join(format!("{session_id}.chat")),
        json!({ "chat": messages }).to_string(),
    )
    .unwrap();
}

const TS_BASE: i64 = 1736899200000; // 2025-01-15T00:00:00Z

#[tokio::test]
async fn empty_corpus_returns_empty_response() {
    let tmp = TempDir::new().unwrap();
    let (index, embedder) = make_index(make_config(tmp.path()));

    let params = SearchParams::new("anything", index.config());
    let response = search_conversations(&index, &params).await.unwrap();

    assert!(response.results.is_empty());
    assert_eq!(response.total_matches, 0);
    assert!(!response.has_more);
    assert_eq!(response.hint, "No matches found. Try different search terms.");
    // Nothing to embed, not even the query.
    assert_eq!(embedder.embedded_count(), 0);
}

#[tokio::test]
async fn exact_text_match_scores_near_one() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    insert_cli_session(
        &pool,
        "/ws/db",
        "sess-1",
        TS_BASE,
        &[
            ("user", "refactor the database schema", TS_BASE),
            ("assistant", "sure, here is a migration plan", TS_BASE + 1000),
        ],
    )
    .await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));
    let mut params = SearchParams::new("refactor the database schema", index.config());
    params.threshold = 0.99;

    let response = search_conversations(&index, &params).await.unwrap();
    assert_eq!(response.results.len(), 1);
    let hit = &response.results[0];
    assert!(hit.score >= 0.99, "score was {}", hit.score);
    assert_eq!(hit.matched_message.content, "refactor the database schema");
    assert_eq!(hit.matched_message.session_id, "sess-1");
    assert_eq!(hit.matched_message.source, Source::Cli);
}

#[tokio::test]
async fn workspace_scope_filters_identical_content() {
    let tmp = TempDir::new().unwrap();
    write_chat_document(
        tmp.path(),
        "%2Fws%2Fone",
        "ide-a",
        &[("user", "deploy the service", TS_BASE)],
    );
    write_chat_document(
        tmp.path(),
        "%2Fws%2Ftwo",
        "ide-b",
        &[("user", "deploy the service", TS_BASE)],
    );

    let (index, _) = make_index(make_config(tmp.path()));
    let mut params = SearchParams::new("deploy the service", index.config());
    params.workspace = Some("/ws/one".to_string());
    params.threshold = 0.5;

    let response = search_conversations(&index, &params).await.unwrap();
    assert_eq!(response.results.len(), 1);
    assert_eq!(response.results[0].matched_message.workspace, "/ws/one");
    assert_eq!(response.results[0].matched_message.session_id, "ide-a");
}

#[tokio::test]
async fn date_filter_is_half_open() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    let midnight_15 = TS_BASE;
    let late_15 = TS_BASE + 86_340_000; // 23:59
    let midnight_16 = TS_BASE + 86_400_000;
    insert_cli_session(
        &pool,
        "/ws",
        "dates",
        midnight_16,
        &[
            ("user", "message on the fifteenth morning", midnight_15),
            ("user", "message on the fifteenth evening", late_15),
            ("user", "message on the sixteenth", midnight_16),
        ],
    )
    .await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));
    let mut params = SearchParams::new("message", index.config());
    params.threshold = 0.0;
    params.after = Some("2025-01-15".to_string());
    params.before = Some("2025-01-16".to_string());

    let response = search_conversations(&index, &params).await.unwrap();
    assert_eq!(response.total_matches, 2);
    let contents: Vec<&str> = response
        .results
        .iter()
        .map(|r| r.matched_message.content.as_str())
        .collect();
    assert!(contents.contains(&"message on the fifteenth morning"));
    assert!(contents.contains(&"message on the fifteenth evening"));
    assert!(!contents.contains(&"message on the sixteenth"));
}

#[tokio::test]
async fn pagination_pages_without_reordering() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    let turns: Vec<(String, i64)> = (0..25)
        .map(|i| (format!("distinct topic number {i}"), TS_BASE + i * 1000))
        .collect();
    let turn_refs: Vec<(&str, &str, i64)> = turns
        .iter()
        .map(|(text, ts)| ("user", text.as_str(), *ts))
        .collect();
    insert_cli_session(&pool, "/ws", "many", TS_BASE, &turn_refs).await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));

    let mut full = SearchParams::new("topic", index.config());
    full.threshold = 0.0;
    full.max_results = 25;
    let all = search_conversations(&index, &full).await.unwrap();
    assert_eq!(all.total_matches, 25);
    assert_eq!(all.results.len(), 25);
    assert!(!all.has_more);

    let mut page = SearchParams::new("topic", index.config());
    page.threshold = 0.0;
    page.max_results = 10;
    page.offset = 10;
    let second = search_conversations(&index, &page).await.unwrap();
    assert_eq!(second.results.len(), 10);
    assert_eq!(second.total_matches, 25);
    assert!(second.has_more);
    assert_eq!(second.hint, "Showing 11-20 of 25. Use offset: 20 for more.");

    // Pagination slices the same ordering the full query produced.
    let full_uuids: Vec<&str> = all.results[10..20]
        .iter()
        .map(|r| r.matched_message.uuid.as_str())
        .collect();
    let page_uuids: Vec<&str> = second
        .results
        .iter()
        .map(|r| r.matched_message.uuid.as_str())
        .collect();
    assert_eq!(full_uuids, page_uuids);

    page.offset = 20;
    let last = search_conversations(&index, &page).await.unwrap();
    assert_eq!(last.results.len(), 5);
    assert!(!last.has_more);
    assert_eq!(last.hint, "Showing 21-25 of 25 (final page).");
}

#[tokio::test]
async fn refresh_is_incremental_and_idempotent() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("cli.sqlite3");
    let pool = open_store(&db_path).await;
    insert_cli_session(
        &pool,
        "/ws",
        "base",
        TS_BASE,
        &[
            ("user", "first indexed message", TS_BASE),
            ("assistant", "second indexed message", TS_BASE + 1000),
            ("user", "third indexed message", TS_BASE + 2000),
        ],
    )
    .await;

    let (index, embedder) = make_index(make_config(tmp.path()));

    let first = index.snapshot().await.unwrap();
    assert_eq!(first.len(), 3);
    assert_eq!(embedder.embedded_count(), 3);

    // Unchanged corpus: the second refresh performs zero embedder calls.
    let second = index.snapshot().await.unwrap();
    assert_eq!(embedder.embedded_count(), 3);
    assert!(Arc::ptr_eq(&first, &second));

    // One new session with one new message embeds exactly once more.
    insert_cli_session(
        &pool,
        "/ws",
        "addendum",
        TS_BASE + 10_000,
        &[("user", "a brand new message about sharks", TS_BASE + 10_000)],
    )
    .await;
    pool.close().await;

    let third = index.snapshot().await.unwrap();
    assert_eq!(third.len(), 4);
    assert_eq!(embedder.embedded_count(), 4);

    // And the new message is retrievable with the top score.
    let mut params = SearchParams::new("a brand new message about sharks", index.config());
    params.threshold = 0.0;
    let response = search_conversations(&index, &params).await.unwrap();
    assert_eq!(
        response.results[0].matched_message.content,
        "a brand new message about sharks"
    );
    assert!(response.results[0].score >= 0.99);
}

#[tokio::test]
async fn warm_cache_survives_process_restart() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    insert_cli_session(
        &pool,
        "/ws",
        "persisted",
        TS_BASE,
        &[("user", "remember this across restarts", TS_BASE)],
    )
    .await;
    pool.close().await;

    let config = make_config(tmp.path());
    {
        let (index, embedder) = make_index(config.clone());
        index.snapshot().await.unwrap();
        assert_eq!(embedder.embedded_count(), 1);
    }

    // A fresh index over the same cache directory re-embeds nothing.
    let (index, embedder) = make_index(config.clone());
    let snapshot = index.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(embedder.embedded_count(), 0);

    // The persisted artifact is complete, unit-norm, and tmp-free.
    let artifact = total_recall::cache::load(
        &config.embedding.cache_file(),
        "stub-embedder",
        DIMS,
    );
    assert_eq!(artifact.vectors.len(), 1);
    for vector in artifact.vectors.values() {
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
    let leftovers: Vec<String> = std::fs::read_dir(config.embedding.cache_path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name.contains("tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
}

#[tokio::test]
async fn identical_content_shares_one_cache_entry() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    insert_cli_session(
        &pool,
        "/ws/a",
        "s1",
        TS_BASE,
        &[("user", "how do I rebase", TS_BASE)],
    )
    .await;
    insert_cli_session(
        &pool,
        "/ws/b",
        "s2",
        TS_BASE + 1000,
        &[("user", "how do I rebase", TS_BASE + 1000)],
    )
    .await;
    pool.close().await;

    let config = make_config(tmp.path());
    let (index, embedder) = make_index(config.clone());
    let snapshot = index.snapshot().await.unwrap();

    assert_eq!(snapshot.len(), 2);
    // Two messages, one distinct content hash, one embedder call.
    assert_eq!(embedder.embedded_count(), 1);
    let artifact =
        total_recall::cache::load(&config.embedding.cache_file(), "stub-embedder", DIMS);
    assert_eq!(artifact.vectors.len(), 1);
}

#[tokio::test]
async fn dedup_suppresses_repeated_content_and_role() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    insert_cli_session(
        &pool,
        "/ws/a",
        "s1",
        TS_BASE,
        &[("user", "how do I rebase", TS_BASE)],
    )
    .await;
    insert_cli_session(
        &pool,
        "/ws/b",
        "s2",
        TS_BASE + 1000,
        &[
            ("user", "how do I rebase", TS_BASE + 1000),
            ("assistant", "how do I rebase", TS_BASE + 2000),
        ],
    )
    .await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));
    let mut params = SearchParams::new("how do I rebase", index.config());
    params.threshold = 0.0;

    let response = search_conversations(&index, &params).await.unwrap();
    // Same content twice as user collapses to one; the assistant copy stays.
    let user_hits = response
        .results
        .iter()
        .filter(|r| r.matched_message.content == "how do I rebase")
        .filter(|r| r.matched_message.role == total_recall::models::Role::User)
        .count();
    assert_eq!(user_hits, 1);
    assert_eq!(response.total_matches, 2);

    // The kept user hit is the newer one.
    let kept = response
        .results
        .iter()
        .find(|r| r.matched_message.role == total_recall::models::Role::User)
        .unwrap();
    assert_eq!(kept.matched_message.session_id, "s2");
}

#[tokio::test]
async fn raising_threshold_never_adds_results() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    let turns: Vec<(String, i64)> = (0..8)
        .map(|i| (format!("subject {i} entirely unrelated"), TS_BASE + i * 1000))
        .collect();
    let mut turn_refs: Vec<(&str, &str, i64)> = turns
        .iter()
        .map(|(text, ts)| ("user", text.as_str(), *ts))
        .collect();
    turn_refs.push(("user", "the exact query text", TS_BASE + 100_000));
    insert_cli_session(&pool, "/ws", "mixed", TS_BASE, &turn_refs).await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));

    let mut loose = SearchParams::new("the exact query text", index.config());
    loose.threshold = 0.0;
    loose.max_results = 50;
    let all = search_conversations(&index, &loose).await.unwrap();

    let mut strict = loose.clone();
    strict.threshold = 0.9;
    let top = search_conversations(&index, &strict).await.unwrap();

    assert!(top.total_matches <= all.total_matches);
    let all_uuids: Vec<&str> = all
        .results
        .iter()
        .map(|r| r.matched_message.uuid.as_str())
        .collect();
    for result in &top.results {
        assert!(all_uuids.contains(&result.matched_message.uuid.as_str()));
        assert!(result.score >= 0.9);
    }
    // The exact match survives the strict threshold.
    assert_eq!(top.results[0].matched_message.content, "the exact query text");
}

#[tokio::test]
async fn context_window_is_coherent_and_clipped() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    let turns: Vec<(String, i64)> = (0..7)
        .map(|i| (format!("turn number {i}"), TS_BASE + i * 1000))
        .collect();
    let turn_refs: Vec<(&str, &str, i64)> = turns
        .iter()
        .map(|(text, ts)| ("user", text.as_str(), *ts))
        .collect();
    insert_cli_session(&pool, "/ws", "convo", TS_BASE, &turn_refs).await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));

    // Match in the middle: full window of 2 on each side.
    let mut params = SearchParams::new("turn number 3", index.config());
    params.threshold = 0.9;
    params.context_size = 2;
    let response = search_conversations(&index, &params).await.unwrap();
    assert_eq!(response.results.len(), 1);
    let context = &response.results[0].context;
    let texts: Vec<&str> = context.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(
        texts,
        vec!["turn number 1", "turn number 2", "turn number 3", "turn number 4", "turn number 5"]
    );
    let match_flags: Vec<bool> = context.iter().map(|c| c.is_match).collect();
    assert_eq!(match_flags.iter().filter(|&&f| f).count(), 1);
    assert!(match_flags[2]);
    // Temporal order within the window.
    for pair in context.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // Match at the session start: the window truncates, no padding.
    let mut edge = SearchParams::new("turn number 0", index.config());
    edge.threshold = 0.9;
    edge.context_size = 2;
    let response = search_conversations(&index, &edge).await.unwrap();
    let context = &response.results[0].context;
    let texts: Vec<&str> = context.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(texts, vec!["turn number 0", "turn number 1", "turn number 2"]);
    assert!(context[0].is_match);
}

#[tokio::test]
async fn memory_budget_excludes_oldest_sessions() {
    let tmp = TempDir::new().unwrap();
    // 45 one-message sessions with distinct modified times; each is
    // estimated at 10 messages, so a 1 MiB limit fits the 40 newest and
    // excludes the 5 oldest.
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    for i in 0..45i64 {
        insert_cli_session(
            &pool,
            "/ws/bulk",
            &format!("sess-{i:02}"),
            TS_BASE + i * 60_000,
            &[("user", &format!("note number {i}"), TS_BASE + i * 60_000)],
        )
        .await;
    }
    pool.close().await;

    let mut config = (*make_config(tmp.path())).clone();
    config.memory.limit_mb = Some(1);
    let (index, _) = make_index(Arc::new(config));

    let snapshot = index.snapshot().await.unwrap();
    assert_eq!(snapshot.excluded_sessions, 5);
    assert_eq!(snapshot.len(), 40);

    // The newest note is present, the oldest fell out with its session.
    let mut params = SearchParams::new("note number 44", index.config());
    params.threshold = 0.9;
    let response = search_conversations(&index, &params).await.unwrap();
    assert_eq!(response.excluded_sessions, 5);
    assert_eq!(response.results.len(), 1);

    let mut oldest = SearchParams::new("note number 0", index.config());
    oldest.threshold = 0.9;
    let response = search_conversations(&index, &oldest).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn search_is_deterministic() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    let turns: Vec<(String, i64)> = (0..10)
        .map(|i| (format!("deterministic message {i}"), TS_BASE + i * 1000))
        .collect();
    let turn_refs: Vec<(&str, &str, i64)> = turns
        .iter()
        .map(|(text, ts)| ("user", text.as_str(), *ts))
        .collect();
    insert_cli_session(&pool, "/ws", "det", TS_BASE, &turn_refs).await;
    pool.close().await;

    let (index, _) = make_index(make_config(tmp.path()));
    let mut params = SearchParams::new("deterministic message", index.config());
    params.threshold = 0.0;

    let first = search_conversations(&index, &params).await.unwrap();
    let second = search_conversations(&index, &params).await.unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn refresh_failure_keeps_previous_snapshot() {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("cli.sqlite3");
    let pool = open_store(&db_path).await;
    insert_cli_session(
        &pool,
        "/ws",
        "stable",
        TS_BASE,
        &[("user", "the original message", TS_BASE)],
    )
    .await;

    let (index, embedder) = make_index(make_config(tmp.path()));
    let before = index.snapshot().await.unwrap();
    assert_eq!(before.len(), 1);

    // New content appears while the embedder is down: the index keeps
    // serving the previous snapshot instead of failing.
    insert_cli_session(
        &pool,
        "/ws",
        "new-session",
        TS_BASE + 60_000,
        &[("user", "unembeddable newcomer", TS_BASE + 60_000)],
    )
    .await;
    pool.close().await;

    embedder.set_failing(true);
    let during = index.snapshot().await.unwrap();
    assert_eq!(during.len(), 1);

    // Query embedding failure is surfaced as an error to the caller.
    let params = SearchParams::new("anything", index.config());
    assert!(search_conversations(&index, &params).await.is_err());

    // Once the embedder recovers, the refresh completes.
    embedder.set_failing(false);
    let after = index.snapshot().await.unwrap();
    assert_eq!(after.len(), 2);
}

#[tokio::test]
async fn tools_execute_against_the_shared_index() {
    let tmp = TempDir::new().unwrap();
    let pool = open_store(&tmp.path().join("cli.sqlite3")).await;
    insert_cli_session(
        &pool,
        "/ws/tooling",
        "cli-sess",
        TS_BASE,
        &[("user", "configure the linter", TS_BASE)],
    )
    .await;
    pool.close().await;
    write_chat_document(
        tmp.path(),
        "%2Fws%2Ftooling",
        "ide-sess",
        &[("user", "configure the formatter", TS_BASE + 1000)],
    );

    let config = make_config(tmp.path());
    let (index, _) = make_index(config.clone());
    let ctx = ToolContext::new(index, config);
    let registry = ToolRegistry::with_builtins();

    let cli_tool = registry.find("search_cli_history").unwrap();
    let result = cli_tool
        .execute(json!({"query": "configure the linter", "threshold": 0.0}), &ctx)
        .await
        .unwrap();
    let results = result["results"].as_array().unwrap();
    assert!(!results.is_empty());
    for item in results {
        assert_eq!(item["matched_message"]["source"], "cli");
    }

    let ide_tool = registry.find("search_ide_history").unwrap();
    let result = ide_tool
        .execute(json!({"query": "configure the formatter", "threshold": 0.0}), &ctx)
        .await
        .unwrap();
    for item in result["results"].as_array().unwrap() {
        assert_eq!(item["matched_message"]["source"], "ide");
    }

    // Validation errors surface before any work.
    let global = registry.find("search_global_history").unwrap();
    assert!(global.execute(json!({"query": "   "}), &ctx).await.is_err());
    assert!(global
        .execute(json!({"query": "q", "threshold": 2.0}), &ctx)
        .await
        .is_err());
}
