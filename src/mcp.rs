//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to a proper MCP server that Kiro and other
//! MCP clients can connect to over stdio using the standard JSON-RPC
//! protocol. The index is warmed in a background task at startup so the
//! protocol handshake is never blocked on model loading.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};
use tracing::warn;

use crate::tools::{Tool as RecallTool, ToolContext, ToolRegistry};

/// Bridges the tool registry to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct (everything is
/// behind `Arc`), so all sessions share the same index and tool set.
#[derive(Clone)]
pub struct McpBridge {
    ctx: ToolContext,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(ctx: ToolContext, tools: Arc<ToolRegistry>) -> McpBridge {
        McpBridge { ctx, tools }
    }

    /// Convert a search tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn RecallTool) -> Tool {
        let schema_value = tool.parameters_schema();
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> = match schema_value {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            icons: None,
            meta: None,
        }
    }

    /// Look up a tool descriptor by name.
    pub fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "total-recall".to_string(),
                title: Some("Total Recall".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Total Recall — semantic search over your past Kiro conversations. \
                 Use search_project_history for context from the current workspace, \
                 search_global_history for knowledge across all projects, and the \
                 CLI/IDE variants to scope by source."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match tool.execute(params, &self.ctx).await {
            Ok(result) => {
                let text = serde_json::to_string_pretty(&result).unwrap_or_default();
                Ok(CallToolResult::success(vec![Content::text(text)]))
            }
            Err(e) => Ok(CallToolResult::error(vec![Content::text(e.to_string())])),
        }
    }
}

/// Run the MCP server over stdio until the client disconnects.
pub async fn serve_stdio(ctx: ToolContext) -> anyhow::Result<()> {
    let tools = Arc::new(ToolRegistry::with_builtins());
    let bridge = McpBridge::new(ctx.clone(), tools);

    // Preload the embedding model and index without blocking the
    // handshake; errors surface again on the first real search.
    let warm_index = ctx.index.clone();
    tokio::spawn(async move {
        if let Err(e) = warm_index.snapshot().await {
            warn!(error = %e, "Index warm-up failed");
        }
    });

    let service = bridge.serve(rmcp::transport::stdio()).await?;
    service.waiting().await?;
    Ok(())
}
