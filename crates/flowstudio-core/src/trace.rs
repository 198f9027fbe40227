use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::NodeKind;

/// Outcome of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// The node produced its intended output.
    Completed,
    /// The node recovered from a non-fatal condition and produced a fallback output.
    Degraded,
}

/// A non-fatal condition recorded on a step instead of failing the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    UnresolvedVariable { reference: String },
    SchemaValidationFailed { message: String },
    AgentLoopDetected { action: String },
    AgentTimeout { after_secs: u64 },
    HttpStatus { status: u16 },
    ExtractionFailed { file: String, message: String },
    NoBranchTarget { branch: String },
    UnknownLabel { reply: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnresolvedVariable { reference } => {
                write!(f, "unresolved variable {{{{{reference}}}}}")
            }
            Diagnostic::SchemaValidationFailed { message } => {
                write!(f, "structured output failed validation: {message}")
            }
            Diagnostic::AgentLoopDetected { action } => {
                write!(f, "agent repeated action '{action}' without progress")
            }
            Diagnostic::AgentTimeout { after_secs } => {
                write!(f, "agent timed out after {after_secs}s")
            }
            Diagnostic::HttpStatus { status } => write!(f, "HTTP request returned status {status}"),
            Diagnostic::ExtractionFailed { file, message } => {
                write!(f, "could not extract text from {file}: {message}")
            }
            Diagnostic::NoBranchTarget { branch } => {
                write!(f, "branch '{branch}' has no next node")
            }
            Diagnostic::UnknownLabel { reply } => {
                write!(f, "classifier reply '{reply}' matched no label")
            }
        }
    }
}

/// One entry of the per-run execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub node_id: String,
    pub node_type: NodeKind,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl StepRecord {
    /// Read a field by name: `input`, `output`, or any `extra` key.
    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        match name {
            "input" => Some(&self.input),
            "output" => Some(&self.output),
            other => self.extra.get(other),
        }
    }

    /// The successor chosen by a classify or branch step.
    pub fn chosen_next(&self) -> Option<&str> {
        self.extra.get("chosenNextNodeId").and_then(|v| v.as_str())
    }
}

/// Render a JSON value the way it appears when substituted into text.
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
