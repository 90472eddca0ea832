//! The public MCP facade: exposes exactly `search_tools` and `call_tool`,
//! backed by the registry, the search engine and the dispatcher.

use std::sync::Arc;

use aggregator_embeddings::EmbeddingService;
use aggregator_registry::ToolRegistry;
use aggregator_search::{SearchEngine, SearchMode};
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

const SEARCH_RESULT_LIMIT: i64 = 5;

/// The two-tool MCP server: `search_tools` for relevance-ranked catalogue
/// lookup, `call_tool` for proxied invocation.
#[derive(Clone)]
pub struct AggregatorServer {
    registry: Arc<ToolRegistry>,
    search_engine: Arc<SearchEngine>,
    embeddings: Option<Arc<EmbeddingService>>,
    search_mode: SearchMode,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SearchToolsInput {
    /// Natural-language description of the capability you're looking for.
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CallToolInput {
    /// The upstream server (or "internal" for a skill) the tool lives on.
    pub server: String,
    /// The tool's name within that server.
    #[serde(rename = "toolName")]
    pub tool_name: String,
    /// Arguments to pass to the tool, per its input schema.
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Serialize)]
struct ToolSummary {
    name: String,
    description: String,
    server: String,
    input_schema: Value,
}

impl AggregatorServer {
    pub fn new(
        registry: Arc<ToolRegistry>,
        search_engine: Arc<SearchEngine>,
        embeddings: Option<Arc<EmbeddingService>>,
        search_mode: SearchMode,
    ) -> Self {
        AggregatorServer {
            registry,
            search_engine,
            embeddings,
            search_mode,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router]
impl AggregatorServer {
    /// Relevance-ranked lookup over the aggregate tool catalogue. Call this
    /// first to find which upstream tool covers a capability.
    #[tool(
        name = "search_tools",
        description = "Search the aggregated catalogue of upstream tools by natural-language query. Returns the best-matching tools' name, description, server and input schema."
    )]
    async fn search_tools(
        &self,
        params: Parameters<SearchToolsInput>,
    ) -> Result<CallToolResult, McpError> {
        let query = params.0.query;
        debug!("search_tools called with query: {}", query);

        let results = self
            .search_engine
            .search(
                &self.registry,
                self.search_mode,
                &query,
                SEARCH_RESULT_LIMIT,
                self.embeddings.as_deref(),
            )
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;

        let summaries: Vec<ToolSummary> = results
            .into_iter()
            .map(|record| ToolSummary {
                name: record.name,
                description: record.description,
                server: record.server,
                input_schema: record.schema,
            })
            .collect();

        let json_text = serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".to_string());
        let text = format!(
            "{json_text}\n\nIf none of these look right, try a more specific or differently-worded query."
        );

        info!("search_tools returned {} matches", summaries.len());
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Proxy invocation of a specific upstream tool or skill.
    #[tool(
        name = "call_tool",
        description = "Invoke a tool by server and name, as returned by search_tools. Use call_tool directly when you already know which tool you need."
    )]
    async fn call_tool(&self, params: Parameters<CallToolInput>) -> Result<CallToolResult, McpError> {
        let CallToolInput {
            server,
            tool_name,
            arguments,
        } = params.0;
        debug!("call_tool called: {}/{}", server, tool_name);

        let tool = match self.registry.get_tool(&server, &tool_name).await {
            Some(tool) => tool,
            None => {
                return Ok(CallToolResult::error(vec![Content::text(format!(
                    "tool not found: {server}/{tool_name}"
                ))]));
            }
        };

        let args = arguments.unwrap_or_else(|| serde_json::json!({}));
        match aggregator_executor::execute_tool(&self.registry, &tool, args).await {
            Ok(value) => Ok(value_to_call_result(value)),
            Err(err) => Ok(CallToolResult::error(vec![Content::text(err.to_string())])),
        }
    }
}

/// Upstream results already have `CallToolResult`'s own JSON shape
/// (produced by `serde_json::to_value` on the way in); round-trip them
/// back so the facade returns the upstream result verbatim. A skill's
/// final value may not have that shape, in which case it is wrapped as a
/// single text block.
fn value_to_call_result(value: Value) -> CallToolResult {
    serde_json::from_value::<CallToolResult>(value.clone())
        .unwrap_or_else(|_| CallToolResult::success(vec![Content::text(value.to_string())]))
}

#[tool_handler]
impl ServerHandler for AggregatorServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "mcp-aggregator".to_string(),
                title: Some("MCP Tool Aggregator".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                website_url: None,
                icons: None,
            },
            instructions: Some(
                "Aggregates many upstream MCP servers behind two tools. Call search_tools with \
                a natural-language query to find the right upstream tool, then call_tool with \
                its server and name to invoke it."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> AggregatorServer {
        AggregatorServer::new(
            Arc::new(ToolRegistry::new()),
            Arc::new(SearchEngine::new()),
            None,
            SearchMode::Fuzzy,
        )
    }

    #[test]
    fn facade_exposes_exactly_two_tools() {
        let server = server();
        let tools = server.tool_router.list_all();
        assert_eq!(tools.len(), 2, "facade must expose exactly 2 tools, found {}", tools.len());

        let names: Vec<String> = tools.iter().map(|t| t.name.to_string()).collect();
        assert!(names.contains(&"search_tools".to_string()));
        assert!(names.contains(&"call_tool".to_string()));
    }

    #[test]
    fn value_to_call_result_wraps_plain_text_when_not_call_tool_shaped() {
        let result = value_to_call_result(serde_json::json!("bare string"));
        assert_eq!(result.is_error, None);
    }
}
