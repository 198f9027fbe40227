use futures::future::BoxFuture;
use tracing::info;

use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::{value_to_text, Diagnostic};

use super::{NodeHandler, NodeOutput};
use crate::branch::{evaluate, select, BranchTargets, Condition};
use crate::context::ExecutionContext;
use crate::resolver;

/// If/elif/else routing over resolved condition operands.
pub struct BranchHandler;

impl NodeHandler for BranchHandler {
    fn kind(&self) -> NodeKind {
        NodeKind::Branch
    }

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let conditions: Vec<Condition> = node.config_as("conditions")?.unwrap_or_default();
            let targets: BranchTargets = node.config_as("nextSteps")?.unwrap_or_default();
            let mut diagnostics: Vec<Diagnostic> = Vec::new();

            let mut operand = |value: &serde_json::Value| {
                let resolved = resolver::resolve(&value_to_text(value), &ctx.trace);
                diagnostics.extend(resolved.diagnostics());
                resolved.text
            };
            let evaluations: Vec<_> = conditions
                .iter()
                .map(|c| {
                    let left = operand(&c.left);
                    let right = operand(&c.right);
                    evaluate(&c.operator, &left, &right)
                })
                .collect();
            let (taken, evaluation) = select(evaluations);

            info!(
                run_id = %ctx.run_id,
                node_id = %node.id,
                branch = %taken,
                reason = %evaluation.reason,
                "Branch evaluated"
            );

            let mut out = NodeOutput::new(input.clone())
                .with_extra("branchTaken", taken.to_string())
                .with_extra("conditionResult", evaluation.result)
                .with_extra("reason", evaluation.reason);
            if let Some(next) = targets.target(taken) {
                out = out.with_extra("chosenNextNodeId", next);
            }
            Ok(out.with_diagnostics(diagnostics))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node() -> Node {
        Node::new("br", NodeKind::Branch)
            .with_config(
                "conditions",
                json!([
                    {"left": "{{entry.input}}", "operator": "eq", "right": "yes"},
                    {"left": "{{entry.input}}", "operator": "contains", "right": "maybe"}
                ]),
            )
            .with_config("nextSteps", json!({"if": "Y", "elif": ["M"], "else": "N"}))
    }

    fn ctx(input: &str) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(input);
        ctx.trace
            .record(flowstudio_test_utils::step("entry", NodeKind::Entry, json!(input)));
        ctx
    }

    #[tokio::test]
    async fn test_if_branch() {
        let out = BranchHandler
            .execute(&node(), &json!("yes"), &ctx("yes"))
            .await
            .unwrap();
        assert_eq!(out.output, json!("yes"));
        assert_eq!(out.extra["branchTaken"], json!("if"));
        assert_eq!(out.extra["conditionResult"], json!(true));
        assert_eq!(out.extra["reason"], json!("'yes' equals 'yes'"));
        assert_eq!(out.extra["chosenNextNodeId"], json!("Y"));
    }

    #[tokio::test]
    async fn test_elif_and_else() {
        let out = BranchHandler
            .execute(&node(), &json!(null), &ctx("well maybe"))
            .await
            .unwrap();
        assert_eq!(out.extra["branchTaken"], json!("elif-0"));
        assert_eq!(out.extra["chosenNextNodeId"], json!("M"));

        let out = BranchHandler
            .execute(&node(), &json!(null), &ctx("no"))
            .await
            .unwrap();
        assert_eq!(out.extra["branchTaken"], json!("else"));
        assert_eq!(out.extra["conditionResult"], json!(false));
        assert_eq!(out.extra["chosenNextNodeId"], json!("N"));
    }

    #[tokio::test]
    async fn test_unknown_operator_falls_through_to_else() {
        let node = Node::new("br", NodeKind::Branch)
            .with_config(
                "conditions",
                json!([{"left": "{{entry.input}}", "operator": "approx", "right": "yes"}]),
            )
            .with_config("nextSteps", json!({"if": "Y", "else": "N"}));
        let out = BranchHandler
            .execute(&node, &json!("yes"), &ctx("yes"))
            .await
            .unwrap();
        assert_eq!(out.extra["branchTaken"], json!("else"));
        assert_eq!(out.extra["conditionResult"], json!(false));
        assert_eq!(out.extra["chosenNextNodeId"], json!("N"));
    }

    #[tokio::test]
    async fn test_unmapped_branch_has_no_choice() {
        let node = Node::new("br", NodeKind::Branch)
            .with_config("conditions", json!([{"left": "a", "operator": "eq", "right": "b"}]))
            .with_config("nextSteps", json!({"if": "Y"}));
        let out = BranchHandler
            .execute(&node, &json!(null), &ExecutionContext::new("x"))
            .await
            .unwrap();
        assert_eq!(out.extra["branchTaken"], json!("else"));
        assert!(out.extra.get("chosenNextNodeId").is_none());
    }
}
