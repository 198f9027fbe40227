use thiserror::Error;

use crate::trace::StepRecord;

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Graph has no entry node")]
    EntryNodeMissing,

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Invalid config for node {node_id}: {message}")]
    InvalidNodeConfig { node_id: String, message: String },

    // Scheduler errors
    #[error("Maximum workflow depth ({max_depth}) exceeded at node {node_id}")]
    DepthExceeded { node_id: String, max_depth: usize },

    #[error("Node {node_id} failed: {cause}")]
    NodeExecutionFailed {
        node_id: String,
        #[source]
        cause: Box<FlowError>,
    },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run {0} is already in progress")]
    RunInProgress(String),

    // Collaborator errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Retrieval failed: {0}")]
    Retrieval(String),

    #[error("External call failed: {service}: {message}")]
    ExternalCallFailed { service: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowError {
    /// Wrap an executor error with the node it came from.
    ///
    /// Scheduler-level conditions pass through unchanged.
    pub fn in_node(self, node_id: &str) -> Self {
        match self {
            FlowError::Cancelled
            | FlowError::DepthExceeded { .. }
            | FlowError::NodeExecutionFailed { .. } => self,
            other => FlowError::NodeExecutionFailed {
                node_id: node_id.to_string(),
                cause: Box::new(other),
            },
        }
    }

    /// The node that failed, if the error is attributable to one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            FlowError::NodeExecutionFailed { node_id, .. }
            | FlowError::DepthExceeded { node_id, .. }
            | FlowError::InvalidNodeConfig { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// A failed run, carrying every step that completed before the failure.
#[derive(Debug, Error)]
#[error("run {run_id} failed after {} step(s): {error}", trace.len())]
pub struct RunFailure {
    pub run_id: String,
    #[source]
    pub error: FlowError,
    pub trace: Vec<StepRecord>,
}

impl RunFailure {
    pub fn new(run_id: impl Into<String>, error: FlowError, trace: Vec<StepRecord>) -> Self {
        Self {
            run_id: run_id.into(),
            error,
            trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_node_wraps_collaborator_errors() {
        let err = FlowError::LlmRequest("503".into()).in_node("gen1");
        assert_eq!(err.node_id(), Some("gen1"));
        assert!(err.to_string().contains("gen1"));
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn test_in_node_keeps_scheduler_errors() {
        let err = FlowError::Cancelled.in_node("gen1");
        assert!(matches!(err, FlowError::Cancelled));

        let err = FlowError::DepthExceeded {
            node_id: "a".into(),
            max_depth: 50,
        }
        .in_node("b");
        assert_eq!(err.node_id(), Some("a"));
    }

    #[test]
    fn test_run_failure_display() {
        let failure = RunFailure::new("run-1", FlowError::EntryNodeMissing, vec![]);
        assert_eq!(
            failure.to_string(),
            "run run-1 failed after 0 step(s): Graph has no entry node"
        );
    }
}
