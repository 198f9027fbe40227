use std::collections::HashMap;

use tokio_util::sync::CancellationToken;

use flowstudio_core::trace::StepRecord;
use flowstudio_core::types::{FileRef, RunId};

/// Append-only record of completed steps, in completion order.
#[derive(Debug, Default, Clone)]
pub struct Trace {
    steps: Vec<StepRecord>,
    index: HashMap<String, usize>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step. Returns `false` if the node already has a record.
    pub fn record(&mut self, step: StepRecord) -> bool {
        if self.index.contains_key(&step.node_id) {
            return false;
        }
        self.index.insert(step.node_id.clone(), self.steps.len());
        self.steps.push(step);
        true
    }

    pub fn get(&self, node_id: &str) -> Option<&StepRecord> {
        self.index.get(node_id).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.index.contains_key(node_id)
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn last(&self) -> Option<&StepRecord> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn into_steps(self) -> Vec<StepRecord> {
        self.steps
    }
}

/// Per-run state, owned by a single scheduler invocation.
#[derive(Debug)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub raw_input: String,
    pub conversation_id: Option<String>,
    pub uploaded_files: Vec<FileRef>,
    pub trace: Trace,
    pub cancel: CancellationToken,
    /// Memory id of this run's user message, excluded from node history.
    pub user_message_id: Option<String>,
}

impl ExecutionContext {
    pub fn new(raw_input: impl Into<String>) -> Self {
        Self {
            run_id: RunId::new(),
            raw_input: raw_input.into(),
            conversation_id: None,
            uploaded_files: Vec::new(),
            trace: Trace::new(),
            cancel: CancellationToken::new(),
            user_message_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_files(mut self, files: Vec<FileRef>) -> Self {
        self.uploaded_files = files;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}
