//! # Total Recall CLI (`recall`)
//!
//! The `recall` binary serves the MCP tool surface and provides direct
//! terminal access to the same search pipeline.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `recall serve` | Run the MCP stdio server for tool-calling hosts |
//! | `recall search "<query>"` | One-off semantic search printed to stdout |
//! | `recall sources` | Show both conversation sources and their session counts |
//!
//! All commands accept `--config` pointing to a TOML configuration file;
//! when the file does not exist, built-in defaults cover the standard
//! install locations of both stores.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use total_recall::config::{default_config_path, load_config};
use total_recall::embedding::TractEmbedder;
use total_recall::loader::Loader;
use total_recall::models::Source;
use total_recall::query::{search_conversations, SearchParams};
use total_recall::{logging, mcp, RecallIndex, ToolContext};

/// Total Recall — semantic memory over Kiro conversation history.
#[derive(Parser)]
#[command(
    name = "recall",
    about = "Semantic search over Kiro CLI and IDE conversation history",
    version,
    long_about = "Total Recall indexes your past Kiro CLI and IDE conversations with \
    local embeddings and exposes scoped semantic search, both on the command line and \
    as MCP tools over stdio."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `~/.config/kiro-total-recall/config.toml`. A missing
    /// file is fine — defaults cover the standard store locations.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP stdio server.
    ///
    /// Exposes search_project_history, search_global_history,
    /// search_cli_history, and search_ide_history to MCP clients.
    Serve,

    /// Search conversation history from the terminal.
    Search {
        /// The search query.
        query: String,

        /// Restrict to an exact workspace path.
        #[arg(long)]
        workspace: Option<String>,

        /// Restrict to one source: `cli` or `ide`.
        #[arg(long)]
        source: Option<String>,

        /// Only messages on/after this date (ISO 8601, e.g. 2025-01-15).
        #[arg(long)]
        after: Option<String>,

        /// Only messages before this date (ISO 8601).
        #[arg(long)]
        before: Option<String>,

        /// Maximum number of results.
        #[arg(long)]
        limit: Option<usize>,

        /// Minimum similarity in [0, 1].
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// List conversation sources and their session counts.
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let config = Arc::new(load_config(&config_path)?);

    let embedder = Arc::new(TractEmbedder::new(
        &config.embedding.model,
        config.embedding.batch_size,
        config.embedding.cache_path().join("models"),
    ));
    let index = Arc::new(RecallIndex::new(config.clone(), embedder));

    match cli.command {
        Commands::Serve => {
            mcp::serve_stdio(ToolContext::new(index, config)).await?;
        }
        Commands::Search {
            query,
            workspace,
            source,
            after,
            before,
            limit,
            threshold,
        } => {
            let mut params = SearchParams::new(&query, &config);
            params.workspace = workspace;
            params.source = match source.as_deref() {
                Some("cli") => Some(Source::Cli),
                Some("ide") => Some(Source::Ide),
                Some(other) => anyhow::bail!("Unknown source: {other}. Use cli or ide."),
                None => None,
            };
            params.after = after;
            params.before = before;
            if let Some(limit) = limit {
                params.max_results = limit;
            }
            if let Some(threshold) = threshold {
                params.threshold = threshold;
            }

            let response = search_conversations(&index, &params).await?;
            print_results(&response);
        }
        Commands::Sources => {
            print_sources(&config).await;
        }
    }

    Ok(())
}

fn print_results(response: &total_recall::SearchResponse) {
    if response.results.is_empty() {
        println!("No results.");
        println!("{}", response.hint);
        return;
    }

    for (i, result) in response.results.iter().enumerate() {
        let msg = &result.matched_message;
        let date = msg.timestamp.format("%Y-%m-%d %H:%M");
        println!(
            "{}. [{:.2}] {} ({}) {}",
            i + 1,
            result.score,
            msg.role,
            msg.source,
            date
        );
        if !msg.workspace.is_empty() {
            println!("    workspace: {}", msg.workspace);
        }
        println!("    session: {}", msg.session_id);
        println!(
            "    excerpt: \"{}\"",
            msg.content.replace('\n', " ").trim()
        );
        println!();
    }
    println!("{}", response.hint);
    if response.excluded_sessions > 0 {
        println!(
            "(memory limit excluded {} oldest sessions)",
            response.excluded_sessions
        );
    }
}

async fn print_sources(config: &Arc<total_recall::config::Config>) {
    let loader = Loader::new(config.clone());
    let sessions = loader.list_sessions().await;
    let cli_count = sessions.iter().filter(|s| s.source == Source::Cli).count();
    let ide_count = sessions.iter().filter(|s| s.source == Source::Ide).count();

    let cli_path = config
        .sources
        .cli
        .database_path()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(not found)".to_string());

    println!("cli: enabled={} sessions={}", config.sources.cli.enabled, cli_count);
    println!("  database: {cli_path}");
    println!("ide: enabled={} sessions={}", config.sources.ide.enabled, ide_count);
    for pattern in &config.sources.ide.patterns {
        println!("  pattern: {pattern}");
    }
}
