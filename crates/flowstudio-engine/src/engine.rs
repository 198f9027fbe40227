//! Engine facade: resolves the graph, registers the run, records the user
//! turn in conversation memory and drives the scheduler.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use flowstudio_core::error::{FlowError, Result, RunFailure};
use flowstudio_core::graph::Graph;
use flowstudio_core::trace::StepRecord;
use flowstudio_core::traits::{ConversationStore, GraphStore};
use flowstudio_core::types::{FileRef, MemoryMessage, Role, RunId};

use crate::cancel::RunRegistry;
use crate::context::ExecutionContext;
use crate::executors::{Collaborators, HandlerRegistry};
use crate::scheduler::Scheduler;

/// Where the graph for a run comes from.
#[derive(Debug, Clone)]
pub enum GraphSource {
    Graph(Graph),
    /// Looked up by id in the engine's graph store.
    Stored(String),
}

impl From<Graph> for GraphSource {
    fn from(graph: Graph) -> Self {
        GraphSource::Graph(graph)
    }
}

/// Input of one run.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub input: String,
    pub conversation_id: Option<String>,
    pub files: Vec<FileRef>,
    /// Preassigned run id, so callers can cancel before the run returns.
    pub run_id: Option<RunId>,
}

impl ExecuteRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.files = files;
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub duration_ms: u64,
    pub nodes_executed: usize,
    pub total_nodes: usize,
}

/// A successful run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOutcome {
    pub run_id: RunId,
    pub result: serde_json::Value,
    pub trace: Vec<StepRecord>,
    pub stats: RunStats,
    pub conversation_id: Option<String>,
}

pub struct Engine {
    scheduler: Scheduler,
    memory: Arc<dyn ConversationStore>,
    graphs: Option<Arc<dyn GraphStore>>,
    runs: RunRegistry,
}

impl Engine {
    /// Engine with the standard handler for every node type.
    pub fn new(collab: Collaborators) -> Self {
        let registry = HandlerRegistry::standard(&collab);
        Self::with_registry(registry, collab.memory.clone(), collab.config.engine.max_depth)
    }

    pub fn with_registry(
        registry: HandlerRegistry,
        memory: Arc<dyn ConversationStore>,
        max_depth: usize,
    ) -> Self {
        Self {
            scheduler: Scheduler::new(Arc::new(registry), memory.clone(), max_depth),
            memory,
            graphs: None,
            runs: RunRegistry::new(),
        }
    }

    pub fn with_graph_store(mut self, graphs: Arc<dyn GraphStore>) -> Self {
        self.graphs = Some(graphs);
        self
    }

    /// Execute a graph. On failure the partial trace travels with the error.
    pub async fn execute(
        &self,
        source: impl Into<GraphSource>,
        request: ExecuteRequest,
    ) -> std::result::Result<RunOutcome, RunFailure> {
        let run_id = request.run_id.clone().unwrap_or_default();
        let started = Instant::now();

        let graph = self
            .resolve(source.into())
            .await
            .and_then(|graph| graph.validate().map(|_| graph))
            .map_err(|e| {
                warn!(run_id = %run_id, error = %e, "Rejected graph");
                RunFailure::new(run_id.as_str(), e, Vec::new())
            })?;

        let guard = self
            .runs
            .register(run_id.clone())
            .map_err(|e| RunFailure::new(run_id.as_str(), e, Vec::new()))?;
        let mut ctx = ExecutionContext::new(request.input.clone())
            .with_conversation(request.conversation_id.clone())
            .with_files(request.files)
            .with_cancel(guard.token());
        ctx.run_id = run_id.clone();

        if let Some(conversation_id) = request.conversation_id.as_deref() {
            let message = MemoryMessage::new(Role::User, request.input.as_str(), None);
            let message_id = message.id.clone();
            match self.memory.append(conversation_id, message).await {
                Ok(()) => ctx.user_message_id = Some(message_id),
                Err(e) => {
                    warn!(run_id = %run_id, conversation_id, error = %e, "Failed to append user message")
                }
            }
        }

        let result = self.scheduler.run(&graph, &mut ctx).await;
        drop(guard);
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                let trace = ctx.trace.into_steps();
                info!(
                    run_id = %run_id,
                    duration_ms,
                    nodes_executed = trace.len(),
                    total_nodes = graph.nodes.len(),
                    "Run succeeded"
                );
                Ok(RunOutcome {
                    stats: RunStats {
                        duration_ms,
                        nodes_executed: trace.len(),
                        total_nodes: graph.nodes.len(),
                    },
                    run_id,
                    result,
                    trace,
                    conversation_id: request.conversation_id,
                })
            }
            Err(e) => {
                warn!(run_id = %run_id, duration_ms, error = %e, "Run failed");
                Err(RunFailure::new(run_id.as_str(), e, ctx.trace.into_steps()))
            }
        }
    }

    /// Signal cooperative cancellation. Returns `false` when the run is not in flight.
    pub fn cancel(&self, run_id: &RunId) -> bool {
        self.runs.cancel(run_id)
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs.active()
    }

    async fn resolve(&self, source: GraphSource) -> Result<Graph> {
        match source {
            GraphSource::Graph(graph) => Ok(graph),
            GraphSource::Stored(id) => match &self.graphs {
                Some(store) => store.load_graph(&id).await,
                None => Err(FlowError::GraphNotFound(id)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::collaborators;
    use flowstudio_core::graph::NodeKind;
    use flowstudio_test_utils::{graph, MemoryGraphs, MemoryStore, MockInference};
    use serde_json::json;
    use std::time::Duration;

    fn echo_graph() -> Graph {
        graph(
            vec![
                ("entry", NodeKind::Entry, json!({})),
                ("gen", NodeKind::Generate, json!({"userPrompt": "Echo: {{entry.input}}"})),
            ],
            &[("entry", "gen")],
        )
    }

    #[tokio::test]
    async fn test_execute_reports_stats() {
        let engine = Engine::new(collaborators());
        let outcome = engine.execute(echo_graph(), ExecuteRequest::new("hi")).await.unwrap();
        assert_eq!(outcome.result, json!("Echo: hi"));
        assert_eq!(outcome.stats.nodes_executed, 2);
        assert_eq!(outcome.stats.total_nodes, 2);
        assert!(engine.active_runs().is_empty());

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["stats"]["nodesExecuted"], json!(2));
    }

    #[tokio::test]
    async fn test_missing_entry_runs_nothing() {
        let engine = Engine::new(collaborators());
        let g = graph(vec![("gen", NodeKind::Generate, json!({}))], &[]);
        let failure = engine.execute(g, ExecuteRequest::new("hi")).await.unwrap_err();
        assert!(matches!(failure.error, FlowError::EntryNodeMissing));
        assert!(failure.trace.is_empty());
    }

    #[tokio::test]
    async fn test_stored_graph_lookup() {
        let engine = Engine::new(collaborators())
            .with_graph_store(Arc::new(MemoryGraphs::new().with_graph("g1", echo_graph())));
        let outcome = engine
            .execute(GraphSource::Stored("g1".into()), ExecuteRequest::new("x"))
            .await
            .unwrap();
        assert_eq!(outcome.result, json!("Echo: x"));

        let failure = engine
            .execute(GraphSource::Stored("nope".into()), ExecuteRequest::new("x"))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, FlowError::GraphNotFound(ref id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_conversation_turns_are_recorded() {
        let memory = Arc::new(MemoryStore::new());
        let mut collab = collaborators();
        collab.memory = memory.clone();
        let engine = Engine::new(collab);
        let outcome = engine
            .execute(echo_graph(), ExecuteRequest::new("hi").with_conversation("c1"))
            .await
            .unwrap();
        assert_eq!(outcome.conversation_id.as_deref(), Some("c1"));

        let messages = memory.messages("c1");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hi");
        assert_eq!(messages[1].content, "Echo: hi");
        assert_eq!(messages[1].role_type.as_deref(), Some("generate"));
    }

    #[tokio::test]
    async fn test_cancel_in_flight_run() {
        let mut collab = collaborators();
        collab.inference = Arc::new(MockInference::echo().with_delay(Duration::from_secs(30)));
        let engine = Arc::new(Engine::new(collab));
        let run_id = RunId::new();

        let task = {
            let engine = engine.clone();
            let request = ExecuteRequest::new("hi").with_run_id(run_id.clone());
            tokio::spawn(async move { engine.execute(echo_graph(), request).await })
        };

        while !engine.active_runs().contains(&run_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(engine.cancel(&run_id));

        let failure = task.await.unwrap().unwrap_err();
        assert!(matches!(failure.error, FlowError::Cancelled));
        assert!(failure.trace.len() <= 1);
        assert!(!engine.cancel(&run_id));
    }

    #[tokio::test]
    async fn test_duplicate_run_id_is_rejected_while_in_flight() {
        let mut collab = collaborators();
        collab.inference = Arc::new(MockInference::echo().with_delay(Duration::from_secs(30)));
        let engine = Arc::new(Engine::new(collab));
        let run_id = RunId("run-dup".into());

        let task = {
            let engine = engine.clone();
            let request = ExecuteRequest::new("hi").with_run_id(run_id.clone());
            tokio::spawn(async move { engine.execute(echo_graph(), request).await })
        };
        while !engine.active_runs().contains(&run_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let failure = engine
            .execute(echo_graph(), ExecuteRequest::new("again").with_run_id(run_id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, FlowError::RunInProgress(ref id) if id == "run-dup"));
        assert!(failure.trace.is_empty());

        assert!(engine.cancel(&run_id));
        let first = task.await.unwrap().unwrap_err();
        assert!(matches!(first.error, FlowError::Cancelled));
    }
}
