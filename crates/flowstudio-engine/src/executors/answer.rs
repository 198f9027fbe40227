use futures::future::BoxFuture;

use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::value_to_text;

use super::{resolved_config, NodeHandler, NodeOutput};
use crate::context::ExecutionContext;

/// Final answer: the resolved `answerText`, or the node input when unset.
pub struct AnswerHandler;

impl NodeHandler for AnswerHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Answer
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            Ok(match resolved_config(node, "answerText", ctx) {
                Some(r) => {
                    let diagnostics = r.diagnostics();
                    NodeOutput::new(r.text).with_diagnostics(diagnostics)
                }
                None => NodeOutput::new(value_to_text(input)),
            })
        })
    }
}
