use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::{value_to_text, Diagnostic};
use flowstudio_core::types::{GenerateRequest, ImageInput};

use super::prompt::{inference_settings, load_history, HistoryOptions};
use super::structured::{validate_reply, StructuredOutput};
use super::{cancellable, resolved_config, Collaborators, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;
use crate::text::preview;

/// Single inference call with optional history, images and a reply schema.
pub struct GenerateHandler {
    collab: Collaborators,
}

impl GenerateHandler {
    pub fn new(collab: Collaborators) -> Self {
        Self { collab }
    }

    async fn load_images(&self, ctx: &ExecutionContext) -> Vec<ImageInput> {
        let mut images = Vec::new();
        for file in ctx.uploaded_files.iter().filter(|f| f.is_image()) {
            match self.collab.files.fetch(file).await {
                Ok(data) => images.push(ImageInput {
                    name: file.name.clone(),
                    media_type: file.media_type(),
                    data,
                }),
                Err(e) => warn!(run_id = %ctx.run_id, file = %file.name, error = %e, "Skipping unreadable image"),
            }
        }
        images
    }
}

impl NodeHandler for GenerateHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Generate
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut diagnostics: Vec<Diagnostic> = Vec::new();

            let mut system_prompt = resolved_config(node, "systemPrompt", ctx).and_then(|r| {
                diagnostics.extend(r.diagnostics());
                Some(r.text).filter(|s| !s.trim().is_empty())
            });
            let prompt = match resolved_config(node, "userPrompt", ctx) {
                Some(r) if !r.text.trim().is_empty() => {
                    diagnostics.extend(r.diagnostics());
                    r.text
                }
                _ => value_to_text(input),
            };
            let mut settings = inference_settings(node, ctx, &mut diagnostics)?;

            let memory_cfg = &self.collab.config.memory;
            let history = match HistoryOptions::from_node(node)?
                .window(memory_cfg.max_messages, memory_cfg.max_message_chars)
            {
                Some(window) => load_history(self.collab.memory.as_ref(), ctx, window).await,
                None => Vec::new(),
            };

            let structured: StructuredOutput =
                node.config_as("structuredOutput")?.unwrap_or_default();
            let schema = structured.is_active().then(|| structured.schema());
            if schema.is_some() {
                let base = system_prompt.take().unwrap_or_default();
                system_prompt = Some(format!("{base}{}", structured.instructions()));
                settings.json_mode = true;
            }

            let images = if node.config_bool("enableMultimodal").unwrap_or(false) {
                self.load_images(ctx).await
            } else {
                Vec::new()
            };
            let image_names: Vec<String> = images.iter().map(|i| i.name.clone()).collect();

            info!(
                run_id = %ctx.run_id,
                node_id = %node.id,
                prompt = %preview(&prompt),
                history = history.len(),
                images = images.len(),
                structured = schema.is_some(),
                "Calling inference"
            );

            let request = GenerateRequest {
                system_prompt,
                prompt,
                history,
                settings,
                images,
            };
            let reply = if request.images.is_empty() {
                cancellable(ctx, self.collab.inference.generate(request)).await?
            } else {
                cancellable(ctx, self.collab.inference.generate_multimodal(request)).await?
            };
            debug!(run_id = %ctx.run_id, node_id = %node.id, reply = %preview(&reply), "Inference reply");

            let mut out = match &schema {
                Some(schema) => {
                    let checked = validate_reply(schema, &reply);
                    let mut out = NodeOutput::new(checked.value)
                        .with_extra("structuredOutputValid", checked.valid);
                    if let Some(message) = checked.error {
                        out = out
                            .with_extra("structuredOutputError", message.clone())
                            .with_diagnostic(Diagnostic::SchemaValidationFailed { message });
                    }
                    out
                }
                None => NodeOutput::new(reply),
            };

            if !image_names.is_empty() {
                out = out
                    .with_extra("imageCount", image_names.len())
                    .with_extra("images", image_names);
            }
            Ok(out.with_diagnostics(diagnostics))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Trace;
    use flowstudio_core::trace::StepStatus;
    use flowstudio_core::types::{MemoryMessage, Role};
    use crate::testing::collaborators;
    use flowstudio_test_utils::{MemoryFiles, MockInference};
    use serde_json::json;
    use std::sync::Arc;

    fn entry_trace(input: &str) -> Trace {
        let mut trace = Trace::new();
        trace.record(flowstudio_test_utils::step("entry", NodeKind::Entry, json!(input)));
        trace
    }

    #[tokio::test]
    async fn test_resolves_user_prompt() {
        let inference = Arc::new(MockInference::echo());
        let mut collab = collaborators();
        collab.inference = inference.clone();
        let handler = GenerateHandler::new(collab);
        let node = Node::new("gen", NodeKind::Generate)
            .with_config("userPrompt", json!("Echo: {{entry.input}}"))
            .with_config("systemPrompt", json!("Be brief."));
        let mut ctx = ExecutionContext::new("hi");
        ctx.trace = entry_trace("hi");

        let out = handler.execute(&node, &json!("hi"), &ctx).await.unwrap();
        assert_eq!(out.output, json!("Echo: hi"));
        assert_eq!(out.status, StepStatus::Completed);
        let req = inference.last_request().unwrap();
        assert_eq!(req.system_prompt.as_deref(), Some("Be brief."));
    }

    #[tokio::test]
    async fn test_falls_back_to_input() {
        let handler = GenerateHandler::new(collaborators());
        let node = Node::new("gen", NodeKind::Generate);
        let ctx = ExecutionContext::new("raw");
        let out = handler.execute(&node, &json!("upstream text"), &ctx).await.unwrap();
        assert_eq!(out.output, json!("upstream text"));
    }

    #[tokio::test]
    async fn test_unresolved_variable_is_degraded() {
        let handler = GenerateHandler::new(collaborators());
        let node = Node::new("gen", NodeKind::Generate)
            .with_config("userPrompt", json!("Use {{ghost.output}}"));
        let ctx = ExecutionContext::new("x");
        let out = handler.execute(&node, &json!("x"), &ctx).await.unwrap();
        assert_eq!(out.output, json!("Use {{Variable ghost.output not found}}"));
        assert_eq!(out.status, StepStatus::Degraded);
        assert!(matches!(
            out.diagnostics[0],
            Diagnostic::UnresolvedVariable { ref reference } if reference == "ghost.output"
        ));
    }

    #[tokio::test]
    async fn test_structured_output_validated() {
        let inference = Arc::new(MockInference::replies(["```json\n{\"city\": \"Oslo\"}\n```"]));
        let mut collab = collaborators();
        collab.inference = inference.clone();
        let handler = GenerateHandler::new(collab);
        let node = Node::new("gen", NodeKind::Generate)
            .with_config("userPrompt", json!("Where?"))
            .with_config(
                "structuredOutput",
                json!({"enabled": true, "properties": [{"name": "city", "type": "string", "required": true}]}),
            );
        let ctx = ExecutionContext::new("x");
        let out = handler.execute(&node, &json!("x"), &ctx).await.unwrap();
        assert_eq!(out.output, json!({"city": "Oslo"}));
        assert_eq!(out.extra["structuredOutputValid"], json!(true));

        let req = inference.last_request().unwrap();
        assert!(req.settings.json_mode);
        assert!(req.system_prompt.unwrap().contains("JSON schema"));
    }

    #[tokio::test]
    async fn test_structured_output_failure_is_recorded() {
        let inference = Arc::new(MockInference::replies(["{\"town\": 1}"]));
        let mut collab = collaborators();
        collab.inference = inference;
        let handler = GenerateHandler::new(collab);
        let node = Node::new("gen", NodeKind::Generate).with_config(
            "structuredOutput",
            json!({"enabled": true, "properties": [{"name": "city", "required": true}]}),
        );
        let ctx = ExecutionContext::new("x");
        let out = handler.execute(&node, &json!("x"), &ctx).await.unwrap();
        assert_eq!(out.output, json!("{\"town\": 1}"));
        assert_eq!(out.extra["structuredOutputValid"], json!(false));
        assert_eq!(out.status, StepStatus::Degraded);
        assert!(matches!(out.diagnostics[0], Diagnostic::SchemaValidationFailed { .. }));
    }

    #[tokio::test]
    async fn test_history_is_loaded() {
        let inference = Arc::new(MockInference::echo());
        let mut collab = collaborators();
        collab.inference = inference.clone();
        collab
            .memory
            .append("c1", MemoryMessage::new(Role::User, "earlier", None))
            .await
            .unwrap();
        let handler = GenerateHandler::new(collab);
        let node = Node::new("gen", NodeKind::Generate);
        let ctx = ExecutionContext::new("now").with_conversation(Some("c1".into()));
        handler.execute(&node, &json!("now"), &ctx).await.unwrap();
        let req = inference.last_request().unwrap();
        assert_eq!(req.history.len(), 1);
        assert_eq!(req.history[0].content, "earlier");
    }

    #[tokio::test]
    async fn test_multimodal_attaches_images() {
        let inference = Arc::new(MockInference::echo());
        let files = MemoryFiles::new()
            .with_file("cat.png", vec![1, 2, 3])
            .with_file("notes.txt", b"text".to_vec());
        let uploaded = files.refs();
        let mut collab = collaborators();
        collab.inference = inference.clone();
        collab.files = Arc::new(files);
        let handler = GenerateHandler::new(collab);
        let node = Node::new("gen", NodeKind::Generate)
            .with_config("userPrompt", json!("Describe"))
            .with_config("enableMultimodal", json!(true));
        let ctx = ExecutionContext::new("x").with_files(uploaded);

        let out = handler.execute(&node, &json!("x"), &ctx).await.unwrap();
        assert_eq!(out.extra["imageCount"], json!(1));
        assert_eq!(out.extra["images"], json!(["cat.png"]));
        let req = inference.last_request().unwrap();
        assert_eq!(req.images.len(), 1);
        assert_eq!(req.images[0].media_type, "image/png");
    }
}
