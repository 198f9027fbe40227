use std::sync::Arc;

use serde_json::json;

use flowstudio_core::config::AppConfig;
use flowstudio_core::error::FlowError;
use flowstudio_core::graph::{Graph, NodeKind};
use flowstudio_core::traits::InferenceBackend;
use flowstudio_core::types::Role;
use flowstudio_engine::resolver::resolve;
use flowstudio_engine::{Collaborators, Engine, ExecuteRequest, Trace};
use flowstudio_test_utils::{graph, MemoryFiles, MemoryStore, MockAgent, MockInference, MockRetrieval};

fn engine_with(inference: impl InferenceBackend, memory: Arc<MemoryStore>, max_depth: usize) -> Engine {
    let mut config = AppConfig::default();
    config.engine.max_depth = max_depth;
    let collab = Collaborators::new(
        Arc::new(inference),
        Arc::new(MockAgent::reply("agent reply")),
        Arc::new(MockRetrieval::new(Vec::new())),
        memory,
        Arc::new(MemoryFiles::new()),
        Arc::new(config),
    );
    Engine::new(collab)
}

fn engine(inference: impl InferenceBackend) -> Engine {
    engine_with(inference, Arc::new(MemoryStore::new()), 50)
}

fn executed(trace: &[flowstudio_core::trace::StepRecord]) -> Vec<&str> {
    trace.iter().map(|s| s.node_id.as_str()).collect()
}

fn classify_graph() -> Graph {
    graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            (
                "triage",
                NodeKind::Classify,
                json!({
                    "classes": [{"name": "billing"}, {"name": "support"}],
                    "nextSteps": {"billing": "A", "support": "B"}
                }),
            ),
            ("A", NodeKind::Answer, json!({"answerText": "billing team"})),
            ("B", NodeKind::Answer, json!({"answerText": "support team"})),
        ],
        &[("entry", "triage"), ("triage", "A"), ("triage", "B")],
    )
}

fn branch_graph() -> Graph {
    graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            (
                "check",
                NodeKind::Branch,
                json!({
                    "conditions": [{"left": "{{entry.input}}", "operator": "eq", "right": "yes"}],
                    "nextSteps": {"if": "Y", "else": "N"}
                }),
            ),
            ("Y", NodeKind::Answer, json!({"answerText": "went yes"})),
            ("N", NodeKind::Answer, json!({"answerText": "went no"})),
        ],
        &[("entry", "check"), ("check", "Y"), ("check", "N")],
    )
}

#[tokio::test]
async fn echo_through_generate() {
    let g = graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            ("gen", NodeKind::Generate, json!({"userPrompt": "Echo: {{entry.input}}"})),
        ],
        &[("entry", "gen")],
    );
    let outcome = engine(MockInference::echo())
        .execute(g, ExecuteRequest::new("hi"))
        .await
        .unwrap();
    assert_eq!(outcome.result, json!("Echo: hi"));
    assert_eq!(outcome.trace.len(), 2);
    assert_eq!(outcome.trace[1].output, json!("Echo: hi"));
}

#[tokio::test]
async fn classify_fuzzy_match_schedules_one_successor() {
    let outcome = engine(MockInference::replies(["Billing issue"]))
        .execute(classify_graph(), ExecuteRequest::new("my invoice is wrong"))
        .await
        .unwrap();
    assert_eq!(executed(&outcome.trace), vec!["entry", "triage", "A"]);
    assert_eq!(outcome.trace[1].output, json!("billing"));
    assert_eq!(outcome.result, json!("billing team"));
}

#[tokio::test]
async fn branch_routes_on_input() {
    let yes = engine(MockInference::echo())
        .execute(branch_graph(), ExecuteRequest::new("yes"))
        .await
        .unwrap();
    assert_eq!(executed(&yes.trace), vec!["entry", "check", "Y"]);
    assert_eq!(yes.result, json!("went yes"));

    let no = engine(MockInference::echo())
        .execute(branch_graph(), ExecuteRequest::new("no"))
        .await
        .unwrap();
    assert_eq!(executed(&no.trace), vec!["entry", "check", "N"]);
    assert_eq!(no.result, json!("went no"));
}

#[tokio::test]
async fn stale_branch_arm_does_not_block_taken_arm() {
    let g = graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            (
                "check",
                NodeKind::Branch,
                json!({
                    "conditions": [{"left": "{{entry.input}}", "operator": "eq", "right": "yes"}],
                    "nextSteps": {"if": "Y", "else": "deleted-node"}
                }),
            ),
            ("Y", NodeKind::Answer, json!({"answerText": "went yes"})),
        ],
        &[("entry", "check"), ("check", "Y")],
    );
    let outcome = engine(MockInference::echo())
        .execute(g, ExecuteRequest::new("yes"))
        .await
        .unwrap();
    assert_eq!(executed(&outcome.trace), vec!["entry", "check", "Y"]);
    assert_eq!(outcome.result, json!("went yes"));
}

#[tokio::test]
async fn failure_carries_partial_trace() {
    let g = graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            ("fmt", NodeKind::Answer, json!({"answerText": "Q: {{entry.input}}"})),
            ("gen", NodeKind::Generate, json!({"userPrompt": "{{fmt.output}}"})),
        ],
        &[("entry", "fmt"), ("fmt", "gen")],
    );
    let failure = engine(MockInference::failing("model offline"))
        .execute(g, ExecuteRequest::new("hi"))
        .await
        .unwrap_err();
    assert_eq!(executed(&failure.trace), vec!["entry", "fmt"]);
    assert_eq!(failure.error.node_id(), Some("gen"));
    assert!(matches!(failure.error, FlowError::NodeExecutionFailed { .. }));
}

#[tokio::test]
async fn missing_entry_executes_nothing() {
    let g = graph(
        vec![("gen", NodeKind::Generate, json!({"userPrompt": "x"}))],
        &[],
    );
    let failure = engine(MockInference::echo())
        .execute(g, ExecuteRequest::new("hi"))
        .await
        .unwrap_err();
    assert!(matches!(failure.error, FlowError::EntryNodeMissing));
    assert!(failure.trace.is_empty());
}

#[tokio::test]
async fn self_referential_cycle_exceeds_depth() {
    let g = graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            ("gen", NodeKind::Generate, json!({})),
        ],
        &[("entry", "gen"), ("gen", "gen")],
    );
    let failure = engine_with(MockInference::echo(), Arc::new(MemoryStore::new()), 8)
        .execute(g, ExecuteRequest::new("hi"))
        .await
        .unwrap_err();
    assert!(matches!(
        failure.error,
        FlowError::DepthExceeded { ref node_id, max_depth: 8 } if node_id == "gen"
    ));
    assert_eq!(executed(&failure.trace), vec!["entry"]);
}

#[tokio::test]
async fn executed_order_is_topological() {
    let g = graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            ("a", NodeKind::Answer, json!({"answerText": "a"})),
            ("b", NodeKind::Answer, json!({"answerText": "b"})),
            ("c", NodeKind::Answer, json!({"answerText": "c:{{a.output}}{{b.output}}"})),
            ("d", NodeKind::Answer, json!({"answerText": "d:{{c.output}}"})),
        ],
        &[("entry", "b"), ("entry", "a"), ("b", "c"), ("a", "c"), ("c", "d"), ("a", "d")],
    );
    let outcome = engine(MockInference::echo())
        .execute(g.clone(), ExecuteRequest::new("go"))
        .await
        .unwrap();

    let order = executed(&outcome.trace);
    let pos = |id: &str| order.iter().position(|n| *n == id).unwrap();
    for edge in &g.edges {
        assert!(pos(&edge.source) < pos(&edge.target), "{} ran after {}", edge.source, edge.target);
    }
    assert_eq!(outcome.result, json!("d:c:ab"));
}

#[tokio::test]
async fn conversation_memory_threads_turns() {
    let memory = Arc::new(MemoryStore::new());
    let g = graph(
        vec![
            ("entry", NodeKind::Entry, json!({})),
            ("gen", NodeKind::Generate, json!({"userPrompt": "Echo: {{entry.input}}"})),
            ("bot", NodeKind::Agent, json!({"userPrompt": "{{gen.output}}"})),
        ],
        &[("entry", "gen"), ("gen", "bot")],
    );
    let engine = engine_with(MockInference::echo(), memory.clone(), 50);
    engine
        .execute(g.clone(), ExecuteRequest::new("one").with_conversation("conv"))
        .await
        .unwrap();
    engine
        .execute(g, ExecuteRequest::new("two").with_conversation("conv"))
        .await
        .unwrap();

    let messages = memory.messages("conv");
    let roles: Vec<(Role, Option<&str>)> = messages
        .iter()
        .map(|m| (m.role, m.role_type.as_deref()))
        .collect();
    assert_eq!(
        roles,
        vec![
            (Role::User, None),
            (Role::Assistant, Some("generate")),
            (Role::Assistant, Some("agent")),
            (Role::User, None),
            (Role::Assistant, Some("generate")),
            (Role::Assistant, Some("agent")),
        ]
    );
    assert_eq!(messages[3].content, "two");
    assert_eq!(messages[4].content, "Echo: two");
}

#[test]
fn resolving_plain_text_is_identity() {
    let trace = Trace::new();
    for text in ["", "hello", "no braces { here }", "{single}"] {
        let resolved = resolve(text, &trace);
        assert_eq!(resolved.text, text);
        assert!(resolved.diagnostics().is_empty());
    }
}
