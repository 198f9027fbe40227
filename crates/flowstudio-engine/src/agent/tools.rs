use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::RetrievalBackend;
use flowstudio_core::types::{RetrievalMethod, RetrievalQuery, ToolDefinition};

use crate::text::{strip_html_tags, truncate_chars};

/// What a tool call produced. Errors are fed back to the model, not raised.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A capability the agent can invoke by name.
pub trait AgentTool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn input_schema(&self) -> serde_json::Value;

    fn timeout_secs(&self) -> u64 {
        30
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>>;
}

/// Registry of tools available to the agent.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AgentTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl AgentTool) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AgentTool>> {
        self.tools.get(name).cloned()
    }

    /// Sorted tool names.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Definitions for the model, limited to `selected` unless it is empty.
    pub fn definitions(&self, selected: &[String]) -> Vec<ToolDefinition> {
        self.list()
            .into_iter()
            .filter(|name| selected.is_empty() || selected.iter().any(|s| s == name))
            .filter_map(|name| self.tools.get(name))
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Run a tool under its timeout. Unknown tools and failures become error outputs.
    pub async fn execute(&self, name: &str, input: serde_json::Value) -> ToolOutput {
        let Some(tool) = self.get(name) else {
            return ToolOutput::error(format!("Unknown tool: {name}"));
        };
        let timeout = Duration::from_secs(tool.timeout_secs());
        match tokio::time::timeout(timeout, tool.execute(input)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ToolOutput::error(e.to_string()),
            Err(_) => ToolOutput::error(format!(
                "Tool {name} timed out after {}s",
                tool.timeout_secs()
            )),
        }
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Fetches a URL and returns its text, HTML stripped.
pub struct WebFetchTool {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WebFetchInput {
    url: String,
    #[serde(default)]
    max_length: Option<usize>,
}

impl WebFetchTool {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl AgentTool for WebFetchTool {
    fn name(&self) -> &str {
        "web_fetch"
    }

    fn description(&self) -> &str {
        "Fetch content from a URL. Strips HTML tags and returns plain text, truncated to max_length."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch content from"
                },
                "max_length": {
                    "type": "integer",
                    "description": "Maximum characters to return (default: 30000)"
                }
            },
            "required": ["url"]
        })
    }

    fn timeout_secs(&self) -> u64 {
        60
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let params: WebFetchInput = serde_json::from_value(input)?;
            let max_length = params.max_length.unwrap_or(30_000);

            debug!(url = %params.url, "Fetching URL");

            let resp = self
                .client
                .get(&params.url)
                .send()
                .await
                .map_err(|e| FlowError::ExternalCallFailed {
                    service: "web_fetch".into(),
                    message: format!("Request failed: {e}"),
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolOutput::error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let content_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = resp.text().await.map_err(|e| FlowError::ExternalCallFailed {
                service: "web_fetch".into(),
                message: format!("Failed to read response body: {e}"),
            })?;

            let text = if content_type.contains("html") {
                strip_html_tags(&body)
            } else {
                body
            };
            if text.chars().count() > max_length {
                return Ok(ToolOutput::success(format!(
                    "{}\n\n[truncated at {max_length} chars]",
                    text.chars().take(max_length).collect::<String>()
                )));
            }
            Ok(ToolOutput::success(text))
        })
    }
}

/// Searches a knowledge base through the retrieval backend.
pub struct KnowledgeSearchTool {
    backend: Arc<dyn RetrievalBackend>,
    top_k: usize,
}

#[derive(Deserialize)]
struct KnowledgeSearchInput {
    knowledge_id: String,
    query: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

impl KnowledgeSearchTool {
    pub fn new(backend: Arc<dyn RetrievalBackend>, top_k: usize) -> Self {
        Self { backend, top_k }
    }
}

impl AgentTool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn description(&self) -> &str {
        "Search a knowledge base for passages relevant to a query."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "knowledge_id": {
                    "type": "string",
                    "description": "The knowledge base to search"
                },
                "query": {
                    "type": "string",
                    "description": "What to search for"
                },
                "method": {
                    "type": "string",
                    "enum": ["lexical", "vector", "hybrid"],
                    "description": "Search method (default: lexical)"
                },
                "top_k": {
                    "type": "integer",
                    "description": "Maximum passages to return"
                }
            },
            "required": ["knowledge_id", "query"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolOutput>> {
        Box::pin(async move {
            let params: KnowledgeSearchInput = serde_json::from_value(input)?;
            let method = params
                .method
                .as_deref()
                .and_then(RetrievalMethod::parse)
                .unwrap_or(RetrievalMethod::Lexical);
            let passages = self
                .backend
                .retrieve(RetrievalQuery {
                    method,
                    knowledge_id: params.knowledge_id,
                    query: params.query,
                    top_k: params.top_k.unwrap_or(self.top_k),
                    score_threshold: 0.0,
                })
                .await?;

            if passages.is_empty() {
                return Ok(ToolOutput::success("No matching passages found."));
            }
            let text = passages
                .iter()
                .map(|p| {
                    format!(
                        "[{} | score {:.2}]\n{}",
                        p.source_document,
                        p.score,
                        truncate_chars(&p.text_content, 2000)
                    )
                })
                .collect::<Vec<_>>()
                .join("\n\n");
            Ok(ToolOutput::success(text))
        })
    }
}
