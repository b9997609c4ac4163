//! Tool surface: four scoped search entry points over the query engine.
//!
//! Each tool is a thin pre-filter — project scope pins the workspace,
//! CLI/IDE scope pins the source, global applies neither — over the same
//! [`search_conversations`] call. Tools are registered in a
//! [`ToolRegistry`] and exposed to MCP clients by the bridge in
//! [`crate::mcp`].

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::Config;
use crate::index::RecallIndex;
use crate::models::Source;
use crate::query::{search_conversations, SearchParams};

/// Context bridge for tool execution: the index handle and configuration,
/// created once by the server and shared by every invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub index: Arc<RecallIndex>,
    pub config: Arc<Config>,
}

impl ToolContext {
    pub fn new(index: Arc<RecallIndex>, config: Arc<Config>) -> ToolContext {
        ToolContext { index, config }
    }
}

/// A search tool that MCP clients can discover and call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name: a lowercase identifier with underscores.
    fn name(&self) -> &str;

    /// One-line description used for agent discovery.
    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute with validated JSON parameters.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> ToolRegistry {
        ToolRegistry { tools: Vec::new() }
    }

    /// Registry pre-loaded with the four scoped search tools.
    pub fn with_builtins() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(SearchProjectHistoryTool));
        registry.register(Box::new(SearchGlobalHistoryTool));
        registry.register(Box::new(SearchCliHistoryTool));
        registry.register(Box::new(SearchIdeHistoryTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Workspace the calling assistant is operating in.
///
/// Host-provided environment wins over the inherited shell `PWD`, which
/// wins over the process working directory.
pub fn current_workspace() -> String {
    for var in ["KIRO_PROJECT_DIR", "KIRO_WORKSPACE", "PWD"] {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return value;
            }
        }
    }
    std::env::current_dir()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// The parameter schema shared by all four search tools.
fn search_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": "Keywords or sentence describing what to find" },
            "after": { "type": "string", "description": "Filter to messages on/after this date (ISO 8601: \"2025-01-15\")" },
            "before": { "type": "string", "description": "Filter to messages before this date (ISO 8601)" },
            "context_size": { "type": "integer", "description": "Messages to include before AND after each match", "default": 3 },
            "threshold": { "type": "number", "description": "Minimum similarity 0-1", "default": 0.2 },
            "max_results": { "type": "integer", "description": "Maximum results to return", "default": 10 },
            "offset": { "type": "integer", "description": "Skip results for pagination", "default": 0 }
        },
        "required": ["query"]
    })
}

/// Decode the shared search parameters, applying configured defaults.
fn parse_search_params(params: &Value, config: &Config) -> Result<SearchParams> {
    let query = params.get("query").and_then(|v| v.as_str()).unwrap_or("");
    let mut search = SearchParams::new(query, config);

    search.after = params
        .get("after")
        .and_then(|v| v.as_str())
        .map(str::to_string);
    search.before = params
        .get("before")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    if let Some(value) = params.get("context_size") {
        search.context_size = require_unsigned(value, "context_size")? as usize;
    }
    if let Some(value) = params.get("threshold") {
        search.threshold = value
            .as_f64()
            .ok_or_else(|| anyhow::anyhow!("threshold must be a number"))?
            as f32;
    }
    if let Some(value) = params.get("max_results") {
        search.max_results = require_unsigned(value, "max_results")? as usize;
    }
    if let Some(value) = params.get("offset") {
        search.offset = require_unsigned(value, "offset")? as usize;
    }

    Ok(search)
}

fn require_unsigned(value: &Value, name: &str) -> Result<u64> {
    value
        .as_u64()
        .ok_or_else(|| anyhow::anyhow!("{name} must be a non-negative integer"))
}

async fn run_search(
    params: Value,
    ctx: &ToolContext,
    workspace: Option<String>,
    source: Option<Source>,
) -> Result<Value> {
    let mut search = parse_search_params(&params, &ctx.config)?;
    search.workspace = workspace;
    search.source = source;

    let response = search_conversations(&ctx.index, &search).await?;
    Ok(serde_json::to_value(&response)?)
}

/// Search conversation history for the current workspace only.
pub struct SearchProjectHistoryTool;

#[async_trait]
impl Tool for SearchProjectHistoryTool {
    fn name(&self) -> &str {
        "search_project_history"
    }

    fn description(&self) -> &str {
        "Search conversation history for the CURRENT WORKSPACE only. Use this to find \
         workspace-specific context: past decisions, implementation details, bugs \
         discussed, architecture choices in this codebase."
    }

    fn parameters_schema(&self) -> Value {
        search_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        run_search(params, ctx, Some(current_workspace()), None).await
    }
}

/// Search conversation history across all workspaces.
pub struct SearchGlobalHistoryTool;

#[async_trait]
impl Tool for SearchGlobalHistoryTool {
    fn name(&self) -> &str {
        "search_global_history"
    }

    fn description(&self) -> &str {
        "Search conversation history across ALL WORKSPACES. Use this to find \
         cross-project knowledge: user preferences, coding patterns, common \
         solutions, and insights from all previous work."
    }

    fn parameters_schema(&self) -> Value {
        search_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        run_search(params, ctx, None, None).await
    }
}

/// Search CLI conversation history only.
pub struct SearchCliHistoryTool;

#[async_trait]
impl Tool for SearchCliHistoryTool {
    fn name(&self) -> &str {
        "search_cli_history"
    }

    fn description(&self) -> &str {
        "Search Kiro CLI conversation history only. Use this to find conversations \
         from Kiro CLI sessions specifically."
    }

    fn parameters_schema(&self) -> Value {
        search_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        run_search(params, ctx, None, Some(Source::Cli)).await
    }
}

/// Search IDE conversation history only.
pub struct SearchIdeHistoryTool;

#[async_trait]
impl Tool for SearchIdeHistoryTool {
    fn name(&self) -> &str {
        "search_ide_history"
    }

    fn description(&self) -> &str {
        "Search Kiro IDE conversation history only. Use this to find conversations \
         from Kiro IDE sessions specifically."
    }

    fn parameters_schema(&self) -> Value {
        search_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        run_search(params, ctx, None, Some(Source::Ide)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_exposes_four_scoped_tools() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.tools().len(), 4);
        for name in [
            "search_project_history",
            "search_global_history",
            "search_cli_history",
            "search_ide_history",
        ] {
            assert!(registry.find(name).is_some(), "missing tool {name}");
        }
        assert!(registry.find("search_everything").is_none());
    }

    #[test]
    fn test_parse_search_params_defaults() {
        let config = Config::default();
        let params = parse_search_params(&json!({"query": "refactor"}), &config).unwrap();
        assert_eq!(params.query, "refactor");
        assert_eq!(params.context_size, 3);
        assert!((params.threshold - 0.2).abs() < 1e-6);
        assert_eq!(params.max_results, 10);
        assert_eq!(params.offset, 0);
        assert!(params.after.is_none());
    }

    #[test]
    fn test_parse_search_params_overrides() {
        let config = Config::default();
        let raw = json!({
            "query": "q",
            "after": "2025-01-01",
            "before": "2025-02-01",
            "context_size": 1,
            "threshold": 0.75,
            "max_results": 5,
            "offset": 10,
        });
        let params = parse_search_params(&raw, &config).unwrap();
        assert_eq!(params.after.as_deref(), Some("2025-01-01"));
        assert_eq!(params.context_size, 1);
        assert!((params.threshold - 0.75).abs() < 1e-6);
        assert_eq!(params.max_results, 5);
        assert_eq!(params.offset, 10);
    }

    #[test]
    fn test_parse_search_params_rejects_negative() {
        let config = Config::default();
        assert!(parse_search_params(&json!({"query": "q", "max_results": -1}), &config).is_err());
        assert!(parse_search_params(&json!({"query": "q", "offset": -5}), &config).is_err());
        assert!(parse_search_params(&json!({"query": "q", "context_size": -2}), &config).is_err());
    }

    #[test]
    fn test_schema_declares_query_required() {
        let schema = search_schema();
        assert_eq!(schema["required"], json!(["query"]));
        assert!(schema["properties"]["threshold"].is_object());
    }
}
