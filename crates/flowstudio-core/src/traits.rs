use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::graph::Graph;
use crate::types::*;

/// LLM client — multi-provider chat completion.
pub trait LlmClient: Send + Sync + 'static {
    /// Send a chat request and wait for the full response.
    fn chat(&self, config: &ModelConfig, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>>;
}

/// Inference backend used by generate and classify nodes.
pub trait InferenceBackend: Send + Sync + 'static {
    /// Produce a completion for a prompt, system prompt, and history.
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<String>>;

    /// Produce a completion for a prompt with attached images.
    ///
    /// Backends without vision support may ignore the images.
    fn generate_multimodal(&self, request: GenerateRequest) -> BoxFuture<'_, Result<String>> {
        self.generate(request)
    }
}

/// Autonomous tool-using agent.
///
/// Loop and timeout conditions come back as explanatory text, never as errors.
pub trait AgentBackend: Send + Sync + 'static {
    fn execute_agent(&self, request: AgentRequest) -> BoxFuture<'_, Result<AgentOutcome>>;
}

/// What an agent run produced, plus how it ended.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub text: String,
    pub termination: AgentTermination,
}

impl AgentOutcome {
    pub fn finished(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            termination: AgentTermination::Finished,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentTermination {
    Finished,
    LoopDetected { action: String },
    TimedOut { after_secs: u64 },
    IterationLimit,
}

/// Knowledge-base retrieval backend.
pub trait RetrievalBackend: Send + Sync + 'static {
    fn retrieve(&self, query: RetrievalQuery) -> BoxFuture<'_, Result<Vec<Passage>>>;
}

/// Conversation memory — append-only message log per conversation id.
pub trait ConversationStore: Send + Sync + 'static {
    fn append(
        &self,
        conversation_id: &str,
        message: MemoryMessage,
    ) -> BoxFuture<'_, Result<()>>;

    /// Load messages in chronological order.
    fn load(&self, conversation_id: &str) -> BoxFuture<'_, Result<Vec<MemoryMessage>>>;
}

/// Resolves uploaded-file references to bytes.
pub trait FileAccess: Send + Sync + 'static {
    fn fetch(&self, file: &FileRef) -> BoxFuture<'_, Result<Vec<u8>>>;
}

/// Persistent graph records keyed by uuid.
pub trait GraphStore: Send + Sync + 'static {
    fn load_graph(&self, id: &str) -> BoxFuture<'_, Result<Graph>>;
}
