use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Top-level flowstudio configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub fallback_models: Vec<ModelConfig>,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            model: ModelConfig::default(),
            fallback_models: Vec::new(),
            memory: MemoryConfig::default(),
            agent: AgentConfig::default(),
            http: HttpConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: None,
        }
    }
}

/// Scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum activation depth before a run fails with `DepthExceeded`.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_workspace")]
    pub workspace: String,
    /// Directory of `<uuid>.json` graph files.
    #[serde(default)]
    pub graphs_dir: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            workspace: default_workspace(),
            graphs_dir: None,
        }
    }
}

fn default_max_depth() -> usize { 50 }
fn default_workspace() -> String { "~/.flowstudio".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Context window for providers that take one (Ollama `num_ctx`).
    #[serde(default)]
    pub num_ctx: Option<u32>,
    /// Extra provider options passed through unchanged.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            num_ctx: None,
            options: serde_json::Map::new(),
            timeout_secs: default_model_timeout(),
            retry: None,
        }
    }
}

fn default_provider() -> String { "ollama".to_string() }
fn default_model_id() -> String { "gemma3:12b".to_string() }
fn default_max_tokens() -> u32 { 2048 }
fn default_temperature() -> f32 { 0.7 }
fn default_model_timeout() -> u64 { 60 }

/// Retry configuration for LLM requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Conversation memory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite file, relative to the workspace unless absolute.
    #[serde(default = "default_memory_path")]
    pub path: String,
    /// History window for generate nodes.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Per-message character cap for generate nodes.
    #[serde(default = "default_max_message_chars")]
    pub max_message_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            path: default_memory_path(),
            max_messages: default_max_messages(),
            max_message_chars: default_max_message_chars(),
        }
    }
}

fn default_memory_path() -> String { "memory.db".to_string() }
fn default_max_messages() -> usize { 10 }
fn default_max_message_chars() -> usize { 1000 }

/// Tool-using agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Wall-clock ceiling for one agent node.
    #[serde(default = "default_agent_duration")]
    pub max_duration_secs: u64,
    /// Identical consecutive actions that count as a loop.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: usize,
    #[serde(default = "default_agent_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_agent_max_message_chars")]
    pub max_message_chars: usize,
    /// Characters of tool output fed back to the model.
    #[serde(default = "default_max_tool_output_chars")]
    pub max_tool_output_chars: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_duration_secs: default_agent_duration(),
            loop_threshold: default_loop_threshold(),
            max_messages: default_agent_max_messages(),
            max_message_chars: default_agent_max_message_chars(),
            max_tool_output_chars: default_max_tool_output_chars(),
        }
    }
}

fn default_max_iterations() -> usize { 10 }
fn default_agent_duration() -> u64 { 120 }
fn default_loop_threshold() -> usize { 3 }
fn default_agent_max_messages() -> usize { 5 }
fn default_agent_max_message_chars() -> usize { 500 }
fn default_max_tool_output_chars() -> usize { 8000 }

/// Outbound HTTP node settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_http_timeout() -> u64 { 30 }
fn default_user_agent() -> String { format!("flowstudio/{}", env!("CARGO_PKG_VERSION")) }

/// Knowledge retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_path")]
    pub path: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub score_threshold: f64,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            path: default_retrieval_path(),
            top_k: default_top_k(),
            score_threshold: 0.0,
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

fn default_retrieval_path() -> String { "knowledge.db".to_string() }
fn default_top_k() -> usize { 5 }
fn default_retrieval_timeout() -> u64 { 30 }

/// Embedding model configuration for vector retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name: "openai", "ollama", or any OpenAI-compatible API.
    pub provider: String,
    /// Model name (e.g., "text-embedding-3-small", "nomic-embed-text").
    pub model: String,
    /// Base URL for the embedding API (e.g., "http://localhost:11434/v1").
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_embedding_dims")]
    pub dimensions: usize,
}

fn default_embedding_dims() -> usize { 768 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| FlowError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| FlowError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.engine.max_depth == 0 {
            return Err(FlowError::Config("engine.max_depth must be at least 1".into()));
        }
        if self.agent.loop_threshold < 2 {
            return Err(FlowError::Config("agent.loop_threshold must be at least 2".into()));
        }
        Ok(())
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.engine.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    pub fn memory_path(&self) -> PathBuf {
        self.in_workspace(&self.memory.path)
    }

    pub fn knowledge_path(&self) -> PathBuf {
        self.in_workspace(&self.retrieval.path)
    }

    pub fn graphs_dir(&self) -> PathBuf {
        match &self.engine.graphs_dir {
            Some(dir) => self.in_workspace(dir),
            None => self.workspace_dir().join("graphs"),
        }
    }

    fn in_workspace(&self, p: &str) -> PathBuf {
        let path = PathBuf::from(p);
        if path.is_absolute() {
            path
        } else {
            self.workspace_dir().join(path)
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay literal
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
