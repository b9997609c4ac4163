//! # Total Recall
//!
//! **Local semantic memory over an AI assistant's past conversations.**
//!
//! Total Recall ingests two heterogeneous on-disk conversation stores —
//! the CLI's relational session store and the IDE's per-session chat
//! documents — maintains a persistent, incrementally updated vector index
//! over message text, and exposes four scoped semantic-search tools to an
//! MCP client.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ CLI store   │──▶│              │   │  Embedding   │
//! │ (SQLite)    │   │   Unified    │──▶│  index       │──▶ cache on disk
//! ├─────────────┤   │   loader     │   │ (hash→vec)  │    (atomic, locked)
//! │ IDE store   │──▶│              │   └──────┬──────┘
//! │ (.chat docs)│   └──────────────┘          │ snapshot
//! └─────────────┘                             ▼
//!                                      ┌─────────────┐
//!                                      │ Query engine │──▶ MCP tools (stdio)
//!                                      └─────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **source readers** ([`source_cli`], [`source_ide`]) normalize
//!    both stores into canonical [`models::IndexedMessage`]s.
//! 2. The **unified loader** ([`loader`]) merges and sorts both streams,
//!    computes content hashes and session fingerprints.
//! 3. The **embedding index** ([`index`]) embeds only content hashes
//!    missing from its cache, enforces the memory budget at session
//!    granularity, and persists the cache atomically ([`cache`]).
//! 4. The **query engine** ([`query`]) scores an immutable snapshot by
//!    dot product, deduplicates, and assembles context windows.
//! 5. Results are exposed via the **CLI** (`recall`) and the **MCP
//!    stdio server** ([`mcp`]) as four scoped tools ([`tools`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, defaults, env overrides |
//! | [`models`] | Core data types: `IndexedMessage`, `SessionInfo`, response shapes |
//! | [`source_cli`] | CLI source reader: sessions from the SQLite store |
//! | [`source_ide`] | IDE source reader: chat documents matched by glob |
//! | [`loader`] | Unified loader: merge, sort, hash, fingerprint |
//! | [`embedding`] | `Embedder` trait and the local tract-onnx MiniLM pipeline |
//! | [`cache`] | Persisted embedding cache: atomic rename under advisory lock |
//! | [`index`] | Incremental embedding index, memory budget, snapshots |
//! | [`query`] | Cosine search: filters, dedup, context windows, pagination |
//! | [`tools`] | Four scoped search tools and the tool registry |
//! | [`mcp`] | MCP JSON-RPC bridge over stdio |
//! | [`logging`] | tracing initialisation |

pub mod cache;
pub mod config;
pub mod embedding;
pub mod index;
pub mod loader;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod query;
pub mod source_cli;
pub mod source_ide;
pub mod tools;

pub use index::RecallIndex;
pub use models::{SearchResponse, Source};
pub use query::{search_conversations, SearchParams};
pub use tools::{ToolContext, ToolRegistry};
