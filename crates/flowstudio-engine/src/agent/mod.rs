//! Tool-using agent backend: a native tool-calling loop over a chat client.

pub mod guard;
pub mod tools;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use flowstudio_core::config::{AgentConfig, AppConfig, ModelConfig};
use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::{AgentBackend, AgentOutcome, AgentTermination, LlmClient, RetrievalBackend};
use flowstudio_core::types::*;
use flowstudio_llm::inference::effective_config;

use crate::text::truncate_chars;
use guard::LoopGuard;
pub use tools::{AgentTool, KnowledgeSearchTool, ToolOutput, ToolRegistry, WebFetchTool};

pub const LOOP_MESSAGE: &str = "I noticed I was repeating the same actions without making progress. Please provide more specific instructions.";
pub const TIMEOUT_MESSAGE: &str =
    "Agent execution timed out. Please try again with a more specific query.";
pub const LIMIT_MESSAGE: &str = "Agent stopped due to iteration limit or time limit.";

/// Runs a bounded reason/act loop: the model either answers or calls tools,
/// whose results are fed back until it answers.
pub struct ToolAgent {
    client: Arc<dyn LlmClient>,
    model: ModelConfig,
    tools: ToolRegistry,
    limits: AgentConfig,
}

impl ToolAgent {
    pub fn new(
        client: Arc<dyn LlmClient>,
        model: ModelConfig,
        tools: ToolRegistry,
        limits: AgentConfig,
    ) -> Self {
        Self {
            client,
            model,
            tools,
            limits,
        }
    }

    /// Agent with the built-in `web_fetch` and `knowledge_search` tools.
    pub fn standard(
        client: Arc<dyn LlmClient>,
        config: &AppConfig,
        retrieval: Arc<dyn RetrievalBackend>,
        http: reqwest::Client,
    ) -> Self {
        let mut tools = ToolRegistry::new();
        tools.register(WebFetchTool::new(http));
        tools.register(KnowledgeSearchTool::new(retrieval, config.retrieval.top_k));
        Self::new(client, config.model.clone(), tools, config.agent.clone())
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn timed_out(&self) -> AgentOutcome {
        warn!(after_secs = self.limits.max_duration_secs, "Agent execution timed out");
        AgentOutcome {
            text: TIMEOUT_MESSAGE.to_string(),
            termination: AgentTermination::TimedOut {
                after_secs: self.limits.max_duration_secs,
            },
        }
    }

    async fn run(&self, request: AgentRequest) -> Result<AgentOutcome> {
        let start = Instant::now();
        let max_duration = Duration::from_secs(self.limits.max_duration_secs);
        let max_iterations = request
            .max_iterations
            .unwrap_or(self.limits.max_iterations)
            .max(1);
        let config = effective_config(&self.model, &request.settings);
        let tool_defs = self.tools.definitions(&request.tools);
        let mut guard = LoopGuard::new(self.limits.loop_threshold);

        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(system) = request.system_prompt.as_ref().filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::system(system.clone()));
        }
        for past in &request.history {
            match past.role {
                Role::User => messages.push(ChatMessage::user(past.content.clone())),
                Role::Assistant => messages.push(ChatMessage::assistant_text(past.content.clone())),
                _ => {}
            }
        }
        messages.push(ChatMessage::user(request.input.clone()));

        let mut usage = Usage::default();

        for iteration in 0..max_iterations {
            if request.cancel.is_cancelled() {
                return Err(FlowError::Cancelled);
            }
            let remaining = max_duration.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Ok(self.timed_out());
            }

            debug!(iteration, messages = messages.len(), "Starting agent iteration");

            let chat = ChatRequest {
                messages: messages.clone(),
                tools: tool_defs.clone(),
                json_mode: false,
            };
            let response = tokio::select! {
                biased;
                _ = request.cancel.cancelled() => return Err(FlowError::Cancelled),
                result = tokio::time::timeout(remaining, self.client.chat(&config, chat)) => match result {
                    Ok(response) => response?,
                    Err(_) => return Ok(self.timed_out()),
                },
            };
            usage.input_tokens += response.usage.input_tokens;
            usage.output_tokens += response.usage.output_tokens;

            let calls: Vec<(String, String, serde_json::Value)> = response
                .message
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();

            if calls.is_empty() {
                info!(
                    iterations = iteration + 1,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Agent run complete"
                );
                return Ok(AgentOutcome::finished(response.message.text()));
            }
            messages.push(response.message);

            for (id, name, input) in calls {
                if guard.record(&name, &input) {
                    return Ok(AgentOutcome {
                        text: LOOP_MESSAGE.to_string(),
                        termination: AgentTermination::LoopDetected { action: name },
                    });
                }

                let remaining = max_duration.saturating_sub(start.elapsed());
                let output = tokio::select! {
                    biased;
                    _ = request.cancel.cancelled() => return Err(FlowError::Cancelled),
                    result = tokio::time::timeout(remaining, self.tools.execute(&name, input)) => match result {
                        Ok(output) => output,
                        Err(_) => return Ok(self.timed_out()),
                    },
                };
                if output.is_error {
                    warn!(tool = %name, error = %truncate_chars(&output.content, 200), "Tool call failed");
                } else {
                    debug!(tool = %name, chars = output.content.len(), "Tool call finished");
                }

                let content = truncate_chars(&output.content, self.limits.max_tool_output_chars);
                messages.push(ChatMessage::tool_result(id, content, output.is_error));
            }
        }

        warn!(max_iterations, "Agent hit its iteration limit");
        Ok(AgentOutcome {
            text: LIMIT_MESSAGE.to_string(),
            termination: AgentTermination::IterationLimit,
        })
    }
}

impl AgentBackend for ToolAgent {
    fn execute_agent(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(self.run(request))
    }
}
