use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use flowstudio_core::config::RetrievalConfig;
use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::Diagnostic;
use flowstudio_core::traits::RetrievalBackend;
use flowstudio_core::types::{RetrievalMethod, RetrievalQuery};

use super::{cancellable, resolved_config, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;

/// Knowledge-base lookup. Passages are joined into one context string.
pub struct RetrieveHandler {
    backend: Arc<dyn RetrievalBackend>,
    defaults: RetrievalConfig,
}

impl RetrieveHandler {
    pub fn new(backend: Arc<dyn RetrievalBackend>, defaults: RetrievalConfig) -> Self {
        Self { backend, defaults }
    }
}

impl NodeHandler for RetrieveHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Retrieve
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        _input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let mut diagnostics: Vec<Diagnostic> = Vec::new();

            let method = match node.config_str("method") {
                None => RetrievalMethod::Lexical,
                Some(name) => RetrievalMethod::parse(name).unwrap_or_else(|| {
                    warn!(node_id = %node.id, method = name, "Unknown retrieval method, using lexical");
                    RetrievalMethod::Lexical
                }),
            };
            let query = match resolved_config(node, "query", ctx) {
                Some(r) if !r.text.trim().is_empty() => {
                    diagnostics.extend(r.diagnostics());
                    r.text
                }
                _ => ctx.raw_input.clone(),
            };
            let request = RetrievalQuery {
                method,
                knowledge_id: node.config_str("knowledgeId").unwrap_or_default().to_string(),
                query,
                top_k: node
                    .config_u64("topK")
                    .map(|k| k as usize)
                    .unwrap_or(self.defaults.top_k),
                score_threshold: node
                    .config_f64("scoreThreshold")
                    .unwrap_or(self.defaults.score_threshold),
            };

            info!(
                run_id = %ctx.run_id,
                node_id = %node.id,
                method = ?request.method,
                knowledge_id = %request.knowledge_id,
                top_k = request.top_k,
                "Retrieving passages"
            );

            let passages = cancellable(ctx, self.backend.retrieve(request)).await?;
            let context = passages
                .iter()
                .map(|p| p.text_content.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
            let summary: Vec<serde_json::Value> = passages
                .iter()
                .map(|p| serde_json::json!({"score": p.score, "sourceDocument": p.source_document}))
                .collect();

            Ok(NodeOutput::new(context)
                .with_extra("passages", summary)
                .with_diagnostics(diagnostics))
        })
    }
}
