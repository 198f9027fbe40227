use futures::future::BoxFuture;
use tracing::{info, warn};

use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::{value_to_text, Diagnostic};
use flowstudio_core::traits::AgentTermination;
use flowstudio_core::types::AgentRequest;

use super::prompt::{inference_settings, load_history, HistoryOptions};
use super::{cancellable, resolved_config, Collaborators, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;
use crate::text::preview;

/// Delegates to the tool-using agent collaborator.
pub struct AgentHandler {
    collab: Collaborators,
}

impl AgentHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }
}

impl NodeHandler for AgentHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut diagnostics: Vec<Diagnostic> = Vec::new();
            let mut text = |key: &str| {
                resolved_config(node, key, ctx).and_then(|r| {
                    diagnostics.extend(r.diagnostics());
                    Some(r.text).filter(|s| !s.trim().is_empty())
                })
            };
            let system_prompt = text("systemPrompt");
            let agent_input = text("userPrompt").unwrap_or_else(|| value_to_text(input));
            let settings = inference_settings(node, ctx, &mut diagnostics)?;

            let agent_cfg = &self.collab.config.agent;
            let history = match HistoryOptions::from_node(node)?
                .window(agent_cfg.max_messages, agent_cfg.max_message_chars)
            {
                Some(window) => load_history(self.collab.memory.as_ref(), ctx, window).await,
                None => Vec::new(),
            };

            let tools: Vec<String> = node.config_as("selectedTools")?.unwrap_or_default();
            let max_iterations = node.config_u64("maxIterations").map(|n| n as usize);

            info!(
                run_id = %ctx.run_id,
                node_id = %node.id,
                input = %preview(&agent_input),
                tools = tools.len(),
                history = history.len(),
                "Starting agent"
            );

            let request = AgentRequest {
                system_prompt,
                input: agent_input,
                history,
                settings,
                tools,
                max_iterations,
                cancel: ctx.cancel.clone(),
            };
            let outcome = cancellable(ctx, self.collab.agent.execute_agent(request)).await?;

            let recovered = match &outcome.termination {
                AgentTermination::Finished => None,
                AgentTermination::LoopDetected { action } => Some(Diagnostic::AgentLoopDetected {
                    action: action.clone(),
                }),
                AgentTermination::TimedOut { after_secs } => Some(Diagnostic::AgentTimeout {
                    after_secs: *after_secs,
                }),
                AgentTermination::IterationLimit => None,
            };
            if let Some(d) = &recovered {
                warn!(run_id = %ctx.run_id, node_id = %node.id, condition = %d, "Agent recovered");
            }

            Ok(NodeOutput::new(outcome.text)
                .with_diagnostics(recovered)
                .with_diagnostics(diagnostics))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::collaborators;
    use flowstudio_core::trace::StepStatus;
    use flowstudio_core::traits::AgentOutcome;
    use flowstudio_test_utils::MockAgent;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_passes_request_through() {
        let agent = Arc::new(MockAgent::reply("done"));
        let mut collab = collaborators();
        collab.agent = agent.clone();
        let handler = AgentHandler::new(collab);
        let node = Node::new("ag", NodeKind::Agent)
            .with_config("selectedTools", json!(["web_fetch"]))
            .with_config("maxIterations", json!(4));
        let ctx = ExecutionContext::new("find it");

        let out = handler.execute(&node, &json!("find it"), &ctx).await.unwrap();
        assert_eq!(out.output, json!("done"));
        assert_eq!(out.status, StepStatus::Completed);
        let req = agent.last_request().unwrap();
        assert_eq!(req.input, "find it");
        assert_eq!(req.tools, vec!["web_fetch"]);
        assert_eq!(req.max_iterations, Some(4));
    }

    #[tokio::test]
    async fn test_loop_is_recovered_not_raised() {
        let agent = Arc::new(MockAgent::outcome(AgentOutcome {
            text: "I noticed I was repeating the same actions".into(),
            termination: AgentTermination::LoopDetected {
                action: "web_fetch".into(),
            },
        }));
        let mut collab = collaborators();
        collab.agent = agent;
        let handler = AgentHandler::new(collab);
        let node = Node::new("ag", NodeKind::Agent);
        let ctx = ExecutionContext::new("x");

        let out = handler.execute(&node, &json!("x"), &ctx).await.unwrap();
        assert_eq!(out.status, StepStatus::Degraded);
        assert_eq!(
            out.diagnostics,
            vec![Diagnostic::AgentLoopDetected {
                action: "web_fetch".into()
            }]
        );
    }
}
