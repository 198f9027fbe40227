//! Node handlers, one per [`NodeKind`], dispatched through a lookup table.

pub mod agent;
pub mod answer;
pub mod branch;
pub mod classify;
pub mod entry;
pub mod extract;
pub mod generate;
pub mod http;
pub mod prompt;
pub mod retrieve;
pub mod structured;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use flowstudio_core::config::AppConfig;
use flowstudio_core::error::Result;
use flowstudio_core::graph::{Node, NodeKind};
use flowstudio_core::trace::{Diagnostic, StepStatus};
use flowstudio_core::traits::{
    AgentBackend, ConversationStore, FileAccess, InferenceBackend, RetrievalBackend,
};

use crate::context::ExecutionContext;

/// Executes one node type.
///
/// `input` is the output of the node's first satisfied predecessor, or the
/// raw run input for the entry node.
pub trait NodeHandler: Send + Sync + 'static {
    fn kind(&self) -> NodeKind;

    fn execute<'a>(
        &'a self,
        node: &'a Node,
        input: &'a serde_json::Value,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>>;
}

/// What a handler produced. The scheduler turns this into a step record.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub output: serde_json::Value,
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub diagnostics: Vec<Diagnostic>,
    pub status: StepStatus,
}

impl NodeOutput {
    pub fn new(output: impl Into<serde_json::Value>) -> Self {
        Self {
            output: output.into(),
            extra: serde_json::Map::new(),
            diagnostics: Vec::new(),
            status: StepStatus::Completed,
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    /// Attach non-fatal diagnostics; any diagnostic marks the step degraded.
    pub fn with_diagnostics(mut self, diagnostics: impl IntoIterator<Item = Diagnostic>) -> Self {
        self.diagnostics.extend(diagnostics);
        if !self.diagnostics.is_empty() {
            self.status = StepStatus::Degraded;
        }
        self
    }

    pub fn with_diagnostic(self, diagnostic: Diagnostic) -> Self {
        self.with_diagnostics([diagnostic])
    }
}

/// External services injected into handlers at construction time.
#[derive(Clone)]
pub struct Collaborators {
    pub inference: Arc<dyn InferenceBackend>,
    pub agent: Arc<dyn AgentBackend>,
    pub retrieval: Arc<dyn RetrievalBackend>,
    pub memory: Arc<dyn ConversationStore>,
    pub files: Arc<dyn FileAccess>,
    pub http: reqwest::Client,
    pub config: Arc<AppConfig>,
}

impl Collaborators {
    /// Build with a default outbound HTTP client from `[http]`.
    pub fn new(
        inference: Arc<dyn InferenceBackend>,
        agent: Arc<dyn AgentBackend>,
        retrieval: Arc<dyn RetrievalBackend>,
        memory: Arc<dyn ConversationStore>,
        files: Arc<dyn FileAccess>,
        config: Arc<AppConfig>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.http.timeout_secs))
            .user_agent(config.http.user_agent.clone())
            .build()
            .unwrap_or_default();
        Self {
            inference,
            agent,
            retrieval,
            memory,
            files,
            http,
            config,
        }
    }
}

/// Lookup table from node type to handler.
pub struct HandlerRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: impl NodeHandler) {
        self.handlers.insert(handler.kind(), Arc::new(handler));
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        NodeKind::ALL
            .into_iter()
            .filter(|k| self.handlers.contains_key(k))
            .collect()
    }

    /// A handler for every node type.
    pub fn standard(collab: &Collaborators) -> Self {
        let mut registry = Self::new();
        registry.register(entry::EntryHandler::new(collab.files.clone()));
        registry.register(generate::GenerateHandler::new(collab.clone()));
        registry.register(agent::AgentHandler::new(collab.clone()));
        registry.register(retrieve::RetrieveHandler::new(
            collab.retrieval.clone(),
            collab.config.retrieval.clone(),
        ));
        registry.register(answer::AnswerHandler);
        registry.register(classify::ClassifyHandler::new(collab.clone()));
        registry.register(http::HttpHandler::new(collab.http.clone(), collab.files.clone()));
        registry.register(extract::ExtractHandler::new(collab.files.clone()));
        registry.register(branch::BranchHandler);
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a string config key and substitute variables in it.
pub(crate) fn resolved_config(
    node: &Node,
    key: &str,
    ctx: &ExecutionContext,
) -> Option<crate::resolver::Resolved> {
    node.config_str(key)
        .map(|text| crate::resolver::resolve(text, &ctx.trace))
}

/// Races a collaborator call against the run's cancellation token.
pub(crate) async fn cancellable<T>(
    ctx: &ExecutionContext,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(flowstudio_core::error::FlowError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostics_degrade_status() {
        let out = NodeOutput::new("x");
        assert_eq!(out.status, StepStatus::Completed);
        let out = out.with_diagnostic(Diagnostic::HttpStatus { status: 500 });
        assert_eq!(out.status, StepStatus::Degraded);
        assert_eq!(out.diagnostics.len(), 1);

        let out = NodeOutput::new("y").with_diagnostics(Vec::new());
        assert_eq!(out.status, StepStatus::Completed);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = HandlerRegistry::new();
        registry.register(answer::AnswerHandler);
        registry.register(branch::BranchHandler);
        assert!(registry.get(NodeKind::Answer).is_some());
        assert!(registry.get(NodeKind::Generate).is_none());
        assert_eq!(registry.kinds(), vec![NodeKind::Answer, NodeKind::Branch]);
    }
}
