//! Logging infrastructure.
//!
//! Logs go to stderr: stdout is reserved for the MCP JSON-RPC protocol
//! when serving. The level is controlled via `RUST_LOG`, defaulting to
//! `info`.

use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber for the binary.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true)
        .init();
}

/// Initialize logging for tests (safe to call repeatedly).
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
