use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique identifier of one engine run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "system" => Role::System,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            _ => Role::User,
        }
    }
}

/// A single content block in a chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "image")]
    Image { media_type: String, data: String },

    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A chat message sent to or received from an inference provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Extract all text content from this message.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Extract all tool use blocks from this message.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some((id.as_str(), name.as_str(), input)),
                _ => None,
            })
            .collect()
    }
}

/// Stop reason reported by the provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Tool definition advertised to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A single non-streaming chat completion request.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    /// Ask the provider for a JSON object reply.
    pub json_mode: bool,
}

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A completed chat response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub message: ChatMessage,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Per-call inference settings, merged from `[model]` and node config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceSettings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub num_ctx: Option<u32>,
    /// Free-form provider options passed through unchanged.
    #[serde(default)]
    pub options: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub json_mode: bool,
}

/// Prompt plus context for one inference call.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    pub history: Vec<MemoryMessage>,
    pub settings: InferenceSettings,
    /// Image attachments for multimodal prompts.
    pub images: Vec<ImageInput>,
}

/// An image attached to a prompt.
#[derive(Debug, Clone)]
pub struct ImageInput {
    pub name: String,
    pub media_type: String,
    pub data: Vec<u8>,
}

/// Input to the tool-using agent collaborator.
#[derive(Debug, Clone, Default)]
pub struct AgentRequest {
    pub system_prompt: Option<String>,
    pub input: String,
    pub history: Vec<MemoryMessage>,
    pub settings: InferenceSettings,
    /// Tool names the agent may use; empty means every registered tool.
    pub tools: Vec<String>,
    pub max_iterations: Option<usize>,
    /// Checked before every agent iteration.
    pub cancel: CancellationToken,
}

/// A message persisted in conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Node type that produced an assistant message (`generate` or `agent`).
    #[serde(default)]
    pub role_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MemoryMessage {
    pub fn new(role: Role, content: impl Into<String>, role_type: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            role_type: role_type.map(str::to_string),
            timestamp: Utc::now(),
        }
    }
}

/// A file uploaded alongside the run input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRef {
    pub name: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl FileRef {
    pub fn local(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let mime_type = mime_guess::from_path(&path).first().map(|m| m.to_string());
        Self {
            name,
            path: Some(path),
            url: None,
            mime_type,
        }
    }

    pub fn remote(url: impl Into<String>) -> Self {
        let url = url.into();
        let name = url
            .rsplit('/')
            .next()
            .filter(|s| !s.is_empty())
            .unwrap_or("download")
            .to_string();
        let mime_type = mime_guess::from_path(&name).first().map(|m| m.to_string());
        Self {
            name,
            path: None,
            url: Some(url),
            mime_type,
        }
    }

    /// MIME type, guessed from the file name when not given.
    pub fn media_type(&self) -> String {
        self.mime_type.clone().unwrap_or_else(|| {
            mime_guess::from_path(&self.name)
                .first_or_octet_stream()
                .to_string()
        })
    }

    pub fn is_image(&self) -> bool {
        self.media_type().starts_with("image/")
    }
}

/// Retrieval strategy for knowledge lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrievalMethod {
    Lexical,
    Vector,
    Hybrid,
}

impl RetrievalMethod {
    /// Parse the method names accepted in node configuration.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full-text" | "fulltext" | "lexical" | "keyword" => Some(Self::Lexical),
            "semantic" | "vector" | "embedding" => Some(Self::Vector),
            "hybrid" | "combined" => Some(Self::Hybrid),
            _ => None,
        }
    }
}

/// A retrieved passage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Passage {
    pub text_content: String,
    pub score: f64,
    pub source_document: String,
}

/// A knowledge retrieval query.
#[derive(Debug, Clone)]
pub struct RetrievalQuery {
    pub method: RetrievalMethod,
    pub knowledge_id: String,
    pub query: String,
    pub top_k: usize,
    pub score_threshold: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieval_method_aliases() {
        assert_eq!(RetrievalMethod::parse("full-text"), Some(RetrievalMethod::Lexical));
        assert_eq!(RetrievalMethod::parse("Semantic"), Some(RetrievalMethod::Vector));
        assert_eq!(RetrievalMethod::parse("hybrid"), Some(RetrievalMethod::Hybrid));
        assert_eq!(RetrievalMethod::parse("psychic"), None);
    }

    #[test]
    fn test_file_ref_local_guesses_mime() {
        let f = FileRef::local("/tmp/report.csv");
        assert_eq!(f.name, "report.csv");
        assert_eq!(f.media_type(), "text/csv");
        assert!(!f.is_image());
        assert!(FileRef::local("photo.png").is_image());
    }

    #[test]
    fn test_file_ref_remote_name() {
        let f = FileRef::remote("https://example.com/docs/guide.md");
        assert_eq!(f.name, "guide.md");
        assert_eq!(f.url.as_deref(), Some("https://example.com/docs/guide.md"));
    }

    #[test]
    fn test_chat_message_text() {
        let msg = ChatMessage::assistant_text("hello");
        assert_eq!(msg.text(), "hello");
        assert!(msg.tool_uses().is_empty());
    }
}
