//! The embedding index: content-addressed vector cache, incremental
//! refresh, memory budget, and immutable snapshots.
//!
//! # Refresh protocol
//!
//! On each query the index is asked for a current snapshot:
//!
//! 1. List sessions from the unified loader; if the cheap listing digest
//!    matches the last build, the in-memory snapshot is returned as-is.
//! 2. Otherwise select sessions within the memory budget (newest first),
//!    load their messages, and compute per-session fingerprints.
//! 3. If no fingerprint differs from the last build, the snapshot is
//!    still valid; only the digest is refreshed.
//! 4. Otherwise embed exactly the content hashes missing from the cache,
//!    garbage-collect hashes no longer referenced by any live session,
//!    persist the cache atomically, and materialise a new snapshot.
//!
//! Readers share the current snapshot through an `Arc` swap; a refresh
//! never mutates a snapshot in place. Embedder failure during refresh
//! keeps the previous snapshot in service.

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use sysinfo::System;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheArtifact};
use crate::config::{Config, BYTES_PER_MESSAGE, MEMORY_LIMIT_DISABLED_ENV, MEMORY_LIMIT_ENV};
use crate::embedding::{normalize_l2, Embedder};
use crate::loader::Loader;
use crate::models::{IndexedMessage, SessionInfo};

/// Immutable read-view of the index shared by concurrent queries.
pub struct Snapshot {
    /// Messages sorted by `(timestamp, source, session_id, ordinal)`.
    pub messages: Vec<IndexedMessage>,
    /// Row-major `[len × dims]` matrix of unit-norm embeddings; row `i`
    /// belongs to `messages[i]` — there are no holes.
    embeddings: Vec<f32>,
    dims: usize,
    /// `session_key → message indices` in ordinal (conversation) order.
    session_order: HashMap<String, Vec<usize>>,
    /// Sessions excluded by the memory budget.
    pub excluded_sessions: usize,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Embedding row for message `idx`.
    pub fn vector(&self, idx: usize) -> &[f32] {
        &self.embeddings[idx * self.dims..(idx + 1) * self.dims]
    }

    /// Indices of a session's messages in conversation order.
    pub fn session_indices(&self, session_key: &str) -> &[usize] {
        self.session_order
            .get(session_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

struct IndexState {
    snapshot: Option<Arc<Snapshot>>,
    /// Cheap listing digest of the corpus behind `snapshot`.
    sessions_digest: String,
    /// Fingerprints of the live sessions behind `snapshot`.
    fingerprints: HashMap<String, String>,
    /// In-memory mirror of the content-addressed vector cache.
    vectors: HashMap<String, Vec<f32>>,
    cache_loaded: bool,
}

/// The conversation index. One handle is owned by the service entry point
/// and passed into each query; tests instantiate isolated indexes over
/// fixture corpora.
pub struct RecallIndex {
    config: Arc<Config>,
    embedder: Arc<dyn Embedder>,
    loader: Loader,
    state: RwLock<IndexState>,
    /// Serialises refreshes; readers never wait on it.
    refresh_lock: Mutex<()>,
}

impl RecallIndex {
    pub fn new(config: Arc<Config>, embedder: Arc<dyn Embedder>) -> RecallIndex {
        RecallIndex {
            loader: Loader::new(config.clone()),
            config,
            embedder,
            state: RwLock::new(IndexState {
                snapshot: None,
                sessions_digest: String::new(),
                fingerprints: HashMap::new(),
                vectors: HashMap::new(),
                cache_loaded: false,
            }),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current snapshot, refreshed if the corpus changed.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>> {
        let sessions = self.loader.list_sessions().await;
        let digest = Loader::sessions_digest(&sessions);

        if let Some(snapshot) = self.current_if_digest_matches(&digest) {
            return Ok(snapshot);
        }

        let _guard = self.refresh_lock.lock().await;
        // A concurrent refresh may have caught up while we waited.
        if let Some(snapshot) = self.current_if_digest_matches(&digest) {
            return Ok(snapshot);
        }

        self.refresh(sessions, digest).await
    }

    /// Embed and normalise a query string.
    ///
    /// Failures here are transient and surface to the caller; the index
    /// state is untouched.
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let embedder = self.embedder.clone();
        let owned = vec![text.to_string()];
        let mut vectors = tokio::task::spawn_blocking(move || embedder.embed(&owned))
            .await
            .context("Embedder task failed")??;
        let vector = vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty embedding response"))?;
        if vector.len() != self.embedder.dims() {
            bail!(
                "Embedder returned {} dims, expected {}",
                vector.len(),
                self.embedder.dims()
            );
        }
        Ok(normalize_l2(vector))
    }

    fn current_if_digest_matches(&self, digest: &str) -> Option<Arc<Snapshot>> {
        let state = self.state.read();
        match &state.snapshot {
            Some(snapshot) if state.sessions_digest == digest => Some(snapshot.clone()),
            _ => None,
        }
    }

    async fn refresh(&self, sessions: Vec<SessionInfo>, digest: String) -> Result<Arc<Snapshot>> {
        let dims = self.embedder.dims();
        self.ensure_cache_loaded();

        let limit = memory_limit_bytes(&self.config);
        let (selected, excluded) = select_sessions_within_limit(sessions, limit);
        if selected.is_empty() && excluded > 0 {
            bail!(
                "Memory limit of {} bytes cannot fit a single session; raise memory.limit_mb or set {}",
                limit,
                MEMORY_LIMIT_DISABLED_ENV
            );
        }
        if excluded > 0 {
            warn!(excluded, "Memory limit reached, excluding oldest sessions");
        }

        let corpus = self.loader.load_messages(&selected).await;

        // Unchanged fingerprints mean the previous snapshot is still
        // exact; only the listing digest moved (e.g. a store was touched
        // without content change).
        {
            let mut state = self.state.write();
            if state.fingerprints == corpus.fingerprints {
                if let Some(snapshot) = state.snapshot.clone() {
                    state.sessions_digest = digest;
                    return Ok(snapshot);
                }
            }
        }

        info!(
            sessions = selected.len(),
            messages = corpus.messages.len(),
            "Building conversation index"
        );

        // Embed only content hashes missing from the cache.
        let missing = {
            let state = self.state.read();
            let mut seen = HashSet::new();
            let mut missing: Vec<(String, String)> = Vec::new();
            for msg in &corpus.messages {
                if !state.vectors.contains_key(&msg.content_hash)
                    && seen.insert(msg.content_hash.clone())
                {
                    missing.push((msg.content_hash.clone(), msg.content.clone()));
                }
            }
            missing
        };

        if !missing.is_empty() {
            debug!(count = missing.len(), "Embedding new messages");
            let embedded = match self.embed_missing(&missing).await {
                Ok(embedded) => embedded,
                Err(e) => {
                    // Keep serving the previous snapshot; the digest is
                    // left stale so the next query retries the refresh.
                    let state = self.state.read();
                    if let Some(previous) = &state.snapshot {
                        warn!(error = %e, "Embedding failed, keeping previous snapshot");
                        return Ok(previous.clone());
                    }
                    return Err(e);
                }
            };
            let mut state = self.state.write();
            for (hash, vector) in embedded {
                state.vectors.insert(hash, vector);
            }
        }

        // Garbage-collect hashes referenced by no live session.
        let live_hashes: HashSet<&str> = corpus
            .messages
            .iter()
            .map(|m| m.content_hash.as_str())
            .collect();
        {
            let mut state = self.state.write();
            state.vectors.retain(|hash, _| live_hashes.contains(hash.as_str()));
        }

        self.persist(&corpus.fingerprints).await;

        // Materialise the snapshot: every message gets its vector row.
        let snapshot = {
            let state = self.state.read();
            let mut embeddings = Vec::with_capacity(corpus.messages.len() * dims);
            for msg in &corpus.messages {
                let vector = state.vectors.get(&msg.content_hash).ok_or_else(|| {
                    anyhow::anyhow!("Missing embedding for content hash {}", msg.content_hash)
                })?;
                embeddings.extend_from_slice(vector);
            }

            let mut session_order: HashMap<String, Vec<usize>> = HashMap::new();
            for (idx, msg) in corpus.messages.iter().enumerate() {
                session_order.entry(msg.session_key()).or_default().push(idx);
            }
            for indices in session_order.values_mut() {
                indices.sort_by_key(|&i| corpus.messages[i].ordinal);
            }

            Arc::new(Snapshot {
                messages: corpus.messages,
                embeddings,
                dims,
                session_order,
                excluded_sessions: excluded,
            })
        };

        let mut state = self.state.write();
        state.snapshot = Some(snapshot.clone());
        state.sessions_digest = digest;
        state.fingerprints = corpus.fingerprints;
        info!(messages = snapshot.len(), "Index ready");
        Ok(snapshot)
    }

    fn ensure_cache_loaded(&self) {
        {
            let state = self.state.read();
            if state.cache_loaded {
                return;
            }
        }
        let artifact = cache::load(
            &self.config.embedding.cache_file(),
            self.embedder.model_id(),
            self.embedder.dims(),
        );
        let mut state = self.state.write();
        if !state.cache_loaded {
            debug!(cached = artifact.vectors.len(), "Loaded persisted embedding cache");
            state.vectors = artifact.vectors;
            state.fingerprints = artifact.fingerprints;
            state.cache_loaded = true;
        }
    }

    async fn embed_missing(
        &self,
        missing: &[(String, String)],
    ) -> Result<Vec<(String, Vec<f32>)>> {
        let dims = self.embedder.dims();
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut embedded = Vec::with_capacity(missing.len());

        for batch in missing.chunks(batch_size) {
            let embedder = self.embedder.clone();
            let texts: Vec<String> = batch.iter().map(|(_, text)| text.clone()).collect();
            let vectors = tokio::task::spawn_blocking(move || embedder.embed(&texts))
                .await
                .context("Embedder task failed")??;
            if vectors.len() != batch.len() {
                bail!(
                    "Embedder returned {} vectors for {} texts",
                    vectors.len(),
                    batch.len()
                );
            }
            for ((hash, _), vector) in batch.iter().zip(vectors) {
                if vector.len() != dims {
                    bail!("Embedder returned {} dims, expected {}", vector.len(), dims);
                }
                embedded.push((hash.clone(), normalize_l2(vector)));
            }
        }
        Ok(embedded)
    }

    async fn persist(&self, fingerprints: &HashMap<String, String>) {
        let artifact = {
            let state = self.state.read();
            CacheArtifact {
                model: self.embedder.model_id().to_string(),
                dims: self.embedder.dims(),
                vectors: state.vectors.clone(),
                fingerprints: fingerprints.clone(),
            }
        };
        let cache_file = self.config.embedding.cache_file();
        let lock_file = self.config.embedding.lock_file();

        let result = tokio::task::spawn_blocking(move || {
            cache::save(&cache_file, &lock_file, &artifact)
        })
        .await;

        // A failed persist costs a re-embed on the next cold start, not
        // correctness; the in-memory state is already consistent.
        match result {
            Ok(Err(e)) => warn!(error = %e, "Failed to persist embedding cache"),
            Err(e) => warn!(error = %e, "Cache persistence task failed"),
            Ok(Ok(())) => {}
        }
    }
}

/// Resolve the memory limit in bytes. Zero means unlimited.
pub fn memory_limit_bytes(config: &Config) -> u64 {
    if std::env::var_os(MEMORY_LIMIT_DISABLED_ENV).is_some() {
        return 0;
    }

    if let Ok(raw) = std::env::var(MEMORY_LIMIT_ENV) {
        match raw.parse::<u64>() {
            Ok(mb) => return mb * 1024 * 1024,
            Err(_) => warn!(value = %raw, "Invalid {MEMORY_LIMIT_ENV} value"),
        }
    }

    if let Some(mb) = config.memory.limit_mb {
        return mb * 1024 * 1024;
    }

    let mut sys = System::new();
    sys.refresh_memory();
    let physical = sys.total_memory();
    if physical == 0 {
        return 0;
    }
    (physical as f64 * config.memory.fraction) as u64
}

/// Select the newest sessions that fit within the memory limit.
///
/// Returns the selected sessions and the number excluded. Eviction
/// granularity is the session, never the individual message, so context
/// windows stay coherent.
pub fn select_sessions_within_limit(
    mut sessions: Vec<SessionInfo>,
    memory_limit_bytes: u64,
) -> (Vec<SessionInfo>, usize) {
    if memory_limit_bytes == 0 {
        return (sessions, 0);
    }

    sessions.sort_by(|a, b| b.timestamp_fallback().cmp(&a.timestamp_fallback()));

    let mut selected = Vec::new();
    let mut excluded = 0usize;
    let mut current_bytes = 0u64;

    for session in sessions {
        // Listings do not carry message counts; assume a typical session.
        let msg_count = if session.message_count > 0 {
            session.message_count
        } else {
            10
        };
        let estimated = (msg_count * BYTES_PER_MESSAGE) as u64;
        if current_bytes + estimated <= memory_limit_bytes {
            current_bytes += estimated;
            selected.push(session);
        } else {
            excluded += 1;
        }
    }

    (selected, excluded)
}
