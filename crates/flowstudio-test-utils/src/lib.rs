//! Scripted collaborators and graph fixtures for flowstudio tests.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;

use flowstudio_core::config::{AppConfig, ModelConfig};
use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::graph::{Edge, Graph, Node, NodeKind};
use flowstudio_core::trace::{StepRecord, StepStatus};
use flowstudio_core::traits::*;
use flowstudio_core::types::*;

// ── Inference ───────────────────────────────────────────────────

/// Inference backend that replays scripted replies, then echoes the prompt.
pub struct MockInference {
    replies: Mutex<VecDeque<Result<String>>>,
    requests: Mutex<Vec<GenerateRequest>>,
    delay: Option<Duration>,
}

impl MockInference {
    /// Every call returns the prompt unchanged.
    pub fn echo() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Replies in order; once exhausted, calls echo the prompt.
    pub fn replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::echo();
        mock.replies
            .lock()
            .unwrap()
            .extend(replies.into_iter().map(|r| Ok(r.into())));
        mock
    }

    /// Every call fails with an LLM request error.
    pub fn failing(message: &str) -> Self {
        let mock = Self::echo();
        mock.replies
            .lock()
            .unwrap()
            .push_back(Err(FlowError::LlmRequest(message.to_string())));
        mock
    }

    /// Sleep before answering, to exercise cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<GenerateRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl InferenceBackend for MockInference {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let prompt = request.prompt.clone();
            self.requests.lock().unwrap().push(request);
            let mut replies = self.replies.lock().unwrap();
            match replies.front() {
                Some(Err(FlowError::LlmRequest(msg))) => Err(FlowError::LlmRequest(msg.clone())),
                Some(_) => replies.pop_front().unwrap_or(Ok(prompt)),
                None => Ok(prompt),
            }
        })
    }
}

// ── Chat client ─────────────────────────────────────────────────

/// Chat client that replays scripted responses and records requests.
pub struct MockLlm {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockLlm {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl LlmClient for MockLlm {
    fn chat(&self, _config: &ModelConfig, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| FlowError::LlmRequest("no scripted response left".into()))
        })
    }
}

/// A final assistant answer.
pub fn text_reply(text: &str) -> ChatResponse {
    ChatResponse {
        message: ChatMessage::assistant_text(text),
        stop_reason: StopReason::EndTurn,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

/// An assistant turn that calls one tool.
pub fn tool_call(id: &str, name: &str, input: serde_json::Value) -> ChatResponse {
    ChatResponse {
        message: ChatMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            }],
        },
        stop_reason: StopReason::ToolUse,
        usage: Usage {
            input_tokens: 10,
            output_tokens: 5,
        },
    }
}

// ── Agent ───────────────────────────────────────────────────────

/// Agent backend returning a fixed outcome.
pub struct MockAgent {
    outcome: AgentOutcome,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    pub fn reply(text: &str) -> Self {
        Self::outcome(AgentOutcome::finished(text))
    }

    pub fn outcome(outcome: AgentOutcome) -> Self {
        Self {
            outcome,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn last_request(&self) -> Option<AgentRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

impl AgentBackend for MockAgent {
    fn execute_agent(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutcome>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            Ok(self.outcome.clone())
        })
    }
}

// ── Retrieval ───────────────────────────────────────────────────

/// Retrieval backend returning fixed passages, capped at `top_k`.
pub struct MockRetrieval {
    passages: Vec<Passage>,
    queries: Mutex<Vec<RetrievalQuery>>,
}

impl MockRetrieval {
    pub fn new(passages: Vec<Passage>) -> Self {
        Self {
            passages,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn last_query(&self) -> Option<RetrievalQuery> {
        self.queries.lock().unwrap().last().cloned()
    }
}

impl RetrievalBackend for MockRetrieval {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<Passage>>> {
        Box::pin(async move {
            let hits = self
                .passages
                .iter()
                .filter(|p| p.score >= query.score_threshold)
                .take(query.top_k)
                .cloned()
                .collect();
            self.queries.lock().unwrap().push(query);
            Ok(hits)
        })
    }
}

// ── Conversation memory ─────────────────────────────────────────

/// In-memory conversation store.
#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<String, Vec<MemoryMessage>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<MemoryMessage> {
        self.conversations
            .lock()
            .unwrap()
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl ConversationStore for MemoryStore {
    fn append(&self, conversation_id: &str, message: MemoryMessage) -> BoxFuture<'_, Result<()>> {
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            self.conversations
                .lock()
                .unwrap()
                .entry(conversation_id)
                .or_default()
                .push(message);
            Ok(())
        })
    }

    fn load(&self, conversation_id: &str) -> BoxFuture<'_, Result<Vec<MemoryMessage>>> {
        let messages = self.messages(conversation_id);
        Box::pin(async move { Ok(messages) })
    }
}

// ── Files ───────────────────────────────────────────────────────

/// File access over named in-memory blobs, addressed as `memory://<name>`.
#[derive(Default)]
pub struct MemoryFiles {
    files: Vec<(String, Vec<u8>)>,
}

impl MemoryFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.files.push((name.to_string(), bytes));
        self
    }

    /// References to every file, in insertion order.
    pub fn refs(&self) -> Vec<FileRef> {
        self.files
            .iter()
            .map(|(name, _)| FileRef {
                name: name.clone(),
                path: None,
                url: Some(format!("memory://{name}")),
                mime_type: None,
            })
            .collect()
    }
}

impl FileAccess for MemoryFiles {
    fn fetch(&self, file: &FileRef) -> BoxFuture<'_, Result<Vec<u8>>> {
        let found = self
            .files
            .iter()
            .find(|(name, _)| *name == file.name)
            .map(|(_, bytes)| bytes.clone());
        let name = file.name.clone();
        Box::pin(async move {
            found.ok_or_else(|| {
                FlowError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such file: {name}"),
                ))
            })
        })
    }
}

// ── Graphs ──────────────────────────────────────────────────────

/// Graph store over a map of ids.
#[derive(Default)]
pub struct MemoryGraphs {
    graphs: HashMap<String, Graph>,
}

impl MemoryGraphs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graph(mut self, id: &str, graph: Graph) -> Self {
        self.graphs.insert(id.to_string(), graph);
        self
    }
}

impl GraphStore for MemoryGraphs {
    fn load_graph(&self, id: &str) -> BoxFuture<'_, Result<Graph>> {
        let found = self
            .graphs
            .get(id)
            .cloned()
            .ok_or_else(|| FlowError::GraphNotFound(id.to_string()));
        Box::pin(async move { found })
    }
}

/// Build a graph from `(id, kind, config)` triples and `(source, target)` pairs.
pub fn graph(nodes: Vec<(&str, NodeKind, serde_json::Value)>, edges: &[(&str, &str)]) -> Graph {
    let nodes = nodes
        .into_iter()
        .map(|(id, kind, config)| {
            let mut node = Node::new(id, kind);
            if let serde_json::Value::Object(map) = config {
                node.config = map;
            }
            node
        })
        .collect();
    let edges = edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect();
    Graph::new(nodes, edges)
}

/// A completed step record with the given output.
pub fn step(id: &str, kind: NodeKind, output: serde_json::Value) -> StepRecord {
    StepRecord {
        node_id: id.to_string(),
        node_type: kind,
        label: id.to_string(),
        started_at: Utc::now(),
        duration_ms: 0,
        input: output.clone(),
        output,
        status: StepStatus::Completed,
        extra: serde_json::Map::new(),
        diagnostics: Vec::new(),
    }
}

// ── Config ──────────────────────────────────────────────────────

/// Config rooted in a fresh temporary workspace. Keep the `TempDir` alive.
pub fn temp_config() -> (AppConfig, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.engine.workspace = dir.path().display().to_string();
    (config, dir)
}

/// Write a TOML config file into `dir` and return its path.
pub fn write_config(dir: &std::path::Path, toml_text: &str) -> PathBuf {
    let path = dir.join("flowstudio.toml");
    std::fs::write(&path, toml_text).unwrap();
    path
}
