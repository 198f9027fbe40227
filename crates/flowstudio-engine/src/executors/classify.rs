use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{info, warn};

use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::{value_to_text, Diagnostic};
use flowstudio_core::types::GenerateRequest;

use super::prompt::{inference_settings, load_history, HistoryWindow};
use super::{cancellable, Collaborators, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;
use crate::resolver;

/// Sampling temperature for classification calls.
const CLASSIFY_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Clone, Deserialize)]
pub struct ClassLabel {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Single-shot LLM classifier routing to one successor per label.
pub struct ClassifyHandler {
    collab: Collaborators,
}

impl ClassifyHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }
}

/// Build the classification prompt.
pub fn build_prompt(classes: &[ClassLabel], instruction: Option<&str>, query: &str) -> String {
    let names: Vec<&str> = classes.iter().map(|c| c.name.as_str()).collect();
    let mut prompt = format!(
        "You are a question classifier. Classify the following input into one of these categories:\n{}\n\n",
        names.join(", ")
    );
    for class in classes {
        if let Some(desc) = class.description.as_deref().filter(|d| !d.is_empty()) {
            prompt.push_str(&format!("Class '{}': {}\n", class.name, desc));
        }
    }
    if let Some(instruction) = instruction.filter(|i| !i.is_empty()) {
        prompt.push_str(&format!("\n{instruction}\n"));
    }
    prompt.push_str(&format!(
        "\nInput to classify: {query}\n\nOutput only the class name without any explanation."
    ));
    prompt
}

/// Map a raw reply onto the label set: exact match, then a label contained
/// in the reply (case-insensitive). Returns `None` when nothing matches.
pub fn match_label<'a>(reply: &str, labels: &'a [ClassLabel]) -> Option<&'a str> {
    let reply = reply.trim();
    if let Some(exact) = labels.iter().find(|c| c.name == reply) {
        return Some(&exact.name);
    }
    let lowered = reply.to_lowercase();
    labels
        .iter()
        .find(|c| !c.name.is_empty() && lowered.contains(&c.name.to_lowercase()))
        .map(|c| c.name.as_str())
}

impl NodeHandler for ClassifyHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Classify
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        _input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut diagnostics: Vec<Diagnostic> = Vec::new();

            let classes: Vec<ClassLabel> = node.config_as("classes")?.unwrap_or_default();
            if classes.is_empty() {
                return Err(FlowError::InvalidNodeConfig {
                    node_id: node.id.clone(),
                    message: "classify node has no classes".into(),
                });
            }
            let next_steps: HashMap<String, String> =
                node.config_as("nextSteps")?.unwrap_or_default();

            let query = match node.config_str("inputVariable").filter(|v| !v.is_empty()) {
                Some(reference) => {
                    let reference = reference.trim_matches(|c| c == '{' || c == '}').trim();
                    match resolver::lookup(reference, &ctx.trace) {
                        Some(value) => value_to_text(&value),
                        None => {
                            warn!(node_id = %node.id, reference, "Input variable not found, using run input");
                            diagnostics.push(Diagnostic::UnresolvedVariable {
                                reference: reference.to_string(),
                            });
                            ctx.raw_input.clone()
                        }
                    }
                }
                None => ctx.raw_input.clone(),
            };

            let prompt = build_prompt(&classes, node.config_str("instruction"), &query);
            let mut settings = inference_settings(node, ctx, &mut diagnostics)?;
            settings.temperature = Some(CLASSIFY_TEMPERATURE);

            let history = if node.config_bool("memoryEnabled").unwrap_or(false) {
                let window = HistoryWindow {
                    max_messages: self.collab.config.memory.max_messages,
                    max_message_chars: self.collab.config.memory.max_message_chars,
                };
                load_history(self.collab.memory.as_ref(), ctx, window).await
            } else {
                Vec::new()
            };

            let request = GenerateRequest {
                prompt: prompt.clone(),
                history,
                settings,
                ..Default::default()
            };
            let reply = cancellable(ctx, self.collab.inference.generate(request)).await?;

            let label = match match_label(&reply, &classes) {
                Some(label) => label.to_string(),
                None => {
                    warn!(
                        node_id = %node.id,
                        reply = %reply.trim(),
                        "Classifier reply matched no class, using the first"
                    );
                    diagnostics.push(Diagnostic::UnknownLabel {
                        reply: reply.trim().to_string(),
                    });
                    classes[0].name.clone()
                }
            };

            let prompt_tokens = prompt.split_whitespace().count();
            let completion_tokens = label.split_whitespace().count();
            info!(run_id = %ctx.run_id, node_id = %node.id, label = %label, "Classified input");

            let mut out = NodeOutput::new(label.clone())
                .with_extra("className", label.clone())
                .with_extra("rawReply", reply.trim())
                .with_extra(
                    "usage",
                    serde_json::json!({
                        "prompt_tokens": prompt_tokens,
                        "completion_tokens": completion_tokens,
                        "total_tokens": prompt_tokens + completion_tokens,
                    }),
                );
            if let Some(next) = next_steps.get(&label) {
                out = out.with_extra("chosenNextNodeId", next.clone());
            }
            Ok(out.with_diagnostics(diagnostics))
        })
    }
}
