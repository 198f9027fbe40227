use base64::Engine as _;
use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flowstudio_core::config::ModelConfig;
use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::LlmClient;
use flowstudio_core::types::*;

use super::presets;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible client. Works with OpenAI, vLLM, Groq, OpenRouter, LM Studio, etc.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<OaiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub(crate) struct OaiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiToolCall {
    #[serde(default)]
    id: String,
    #[serde(default = "function_type")]
    r#type: String,
    function: OaiFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OaiToolCall>>,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

fn text_message(role: &str, text: String) -> OaiMessage {
    OaiMessage {
        role: role.to_string(),
        content: Some(serde_json::Value::String(text)),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// User content: a plain string, or text plus `image_url` parts when images are attached.
fn user_content(msg: &ChatMessage) -> serde_json::Value {
    let images: Vec<_> = msg
        .content
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Image { media_type, data } => Some(serde_json::json!({
                "type": "image_url",
                "image_url": { "url": format!("data:{media_type};base64,{data}") }
            })),
            _ => None,
        })
        .collect();

    if images.is_empty() {
        return serde_json::Value::String(msg.text());
    }

    let mut parts = vec![serde_json::json!({ "type": "text", "text": msg.text() })];
    parts.extend(images);
    serde_json::Value::Array(parts)
}

pub(crate) fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OaiMessage> {
    let mut oai_msgs = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System => oai_msgs.push(text_message("system", msg.text())),
            Role::User => oai_msgs.push(OaiMessage {
                role: "user".to_string(),
                content: Some(user_content(&msg)),
                tool_calls: None,
                tool_call_id: None,
            }),
            Role::Assistant => {
                let tool_uses = msg.tool_uses();
                if tool_uses.is_empty() {
                    oai_msgs.push(text_message("assistant", msg.text()));
                    continue;
                }
                let text = msg.text();
                let calls = tool_uses
                    .iter()
                    .map(|(id, name, input)| OaiToolCall {
                        id: id.to_string(),
                        r#type: function_type(),
                        function: OaiFunction {
                            name: name.to_string(),
                            arguments: input.to_string(),
                        },
                    })
                    .collect();
                oai_msgs.push(OaiMessage {
                    role: "assistant".to_string(),
                    content: (!text.is_empty()).then(|| serde_json::Value::String(text)),
                    tool_calls: Some(calls),
                    tool_call_id: None,
                });
            }
            Role::Tool => {
                for block in &msg.content {
                    if let ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } = block
                    {
                        oai_msgs.push(OaiMessage {
                            role: "tool".to_string(),
                            content: Some(serde_json::Value::String(content.clone())),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id.clone()),
                        });
                    }
                }
            }
        }
    }

    oai_msgs
}

/// Resolve the completions endpoint from a configured base URL or preset.
pub(crate) fn endpoint_url(config: &ModelConfig) -> String {
    let base = config
        .base_url
        .clone()
        .or_else(|| presets::get_preset(&config.provider).map(|p| p.default_base_url.to_string()))
        .unwrap_or_else(|| OPENAI_API_URL.to_string());
    let base = base.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{base}/chat/completions")
    }
}

fn parse_response(resp: CompletionResponse) -> Result<ChatResponse> {
    let usage = resp
        .usage
        .map(|u| Usage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| FlowError::LlmParse("response has no choices".into()))?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content.filter(|t| !t.is_empty()) {
        content.push(ContentBlock::Text { text });
    }
    for call in choice.message.tool_calls.unwrap_or_default() {
        let input = serde_json::from_str(&call.function.arguments).unwrap_or_else(|e| {
            warn!(tool = %call.function.name, error = %e, "Tool arguments are not valid JSON");
            serde_json::json!({})
        });
        content.push(ContentBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input,
        });
    }

    let stop_reason = match choice.finish_reason.as_deref() {
        Some("tool_calls") => StopReason::ToolUse,
        Some("length") => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    };

    Ok(ChatResponse {
        message: ChatMessage {
            role: Role::Assistant,
            content,
        },
        stop_reason,
        usage,
    })
}

impl LlmClient for OpenAiClient {
    fn chat(&self, config: &ModelConfig, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        let config = config.clone();

        Box::pin(async move {
            let url = endpoint_url(&config);

            let body = CompletionRequest {
                model: config.model_id.clone(),
                messages: convert_messages(request.messages),
                max_tokens: config.max_tokens,
                temperature: Some(config.temperature),
                tools: convert_tools(&request.tools),
                response_format: request
                    .json_mode
                    .then(|| serde_json::json!({ "type": "json_object" })),
            };

            debug!(url = %url, model = %config.model_id, "Sending chat completion");

            let mut req = self.http.post(&url).json(&body);

            if let Some(api_key) = &config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }
            if let Some(preset) = presets::get_preset(&config.provider) {
                for (k, v) in preset.extra_headers {
                    req = req.header(*k, *v);
                }
            }

            let response = req
                .send()
                .await
                .map_err(|e| FlowError::LlmRequest(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(FlowError::LlmRequest(format!("HTTP {}: {}", status, body)));
            }

            let parsed: CompletionResponse = response
                .json()
                .await
                .map_err(|e| FlowError::LlmParse(e.to_string()))?;
            parse_response(parsed)
        })
    }
}

/// Encode raw image bytes as an image content block.
pub fn image_block(media_type: &str, bytes: &[u8]) -> ContentBlock {
    ContentBlock::Image {
        media_type: media_type.to_string(),
        data: base64::engine::general_purpose::STANDARD.encode(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str) -> ModelConfig {
        ModelConfig {
            provider: "openai".into(),
            model_id: "gpt-4o-mini".into(),
            api_key: Some("sk-test".into()),
            base_url: Some(base_url.to_string()),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_endpoint_url_appends_path() {
        let mut cfg = config("http://localhost:1234/v1/");
        assert_eq!(endpoint_url(&cfg), "http://localhost:1234/v1/chat/completions");
        cfg.base_url = Some("https://api.groq.com/openai/v1/chat/completions".into());
        assert_eq!(
            endpoint_url(&cfg),
            "https://api.groq.com/openai/v1/chat/completions"
        );
        cfg.base_url = None;
        assert_eq!(endpoint_url(&cfg), OPENAI_API_URL);
    }

    #[test]
    fn test_convert_messages_with_image() {
        let msg = ChatMessage {
            role: Role::User,
            content: vec![
                ContentBlock::Text { text: "what is this?".into() },
                image_block("image/png", b"\x89PNG"),
            ],
        };
        let converted = convert_messages(vec![msg]);
        let v = serde_json::to_value(&converted[0]).unwrap();
        assert_eq!(v["content"][0]["text"], "what is this?");
        assert!(v["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_convert_tool_round() {
        let assistant = ChatMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::ToolUse {
                id: "call_1".into(),
                name: "web_fetch".into(),
                input: serde_json::json!({"url": "https://example.com"}),
            }],
        };
        let result = ChatMessage::tool_result("call_1", "page text", false);
        let converted = convert_messages(vec![assistant, result]);
        let v = serde_json::to_value(&converted).unwrap();
        assert!(v[0].get("content").is_none());
        assert_eq!(v[0]["tool_calls"][0]["function"]["name"], "web_fetch");
        assert_eq!(v[1]["role"], "tool");
        assert_eq!(v[1]["tool_call_id"], "call_1");
    }

    #[tokio::test]
    async fn test_chat_text_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .and(body_partial_json(serde_json::json!({"model": "gpt-4o-mini"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "Echo: hi"}, "finish_reason": "stop"}],
                "usage": {"prompt_tokens": 5, "completion_tokens": 3}
            })))
            .mount(&server)
            .await;

        let client = OpenAiClient::new();
        let resp = client
            .chat(
                &config(&format!("{}/v1", server.uri())),
                ChatRequest {
                    messages: vec![ChatMessage::user("hi")],
                    ..ChatRequest::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.message.text(), "Echo: hi");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn test_chat_tool_call_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "message": {
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": {"name": "knowledge_search", "arguments": "{\"query\":\"refunds\"}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            })))
            .mount(&server)
            .await;

        let resp = OpenAiClient::new()
            .chat(&config(&server.uri()), ChatRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        let uses = resp.message.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].1, "knowledge_search");
        assert_eq!(uses[0].2["query"], "refunds");
    }

    #[tokio::test]
    async fn test_chat_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = OpenAiClient::new()
            .chat(&config(&server.uri()), ChatRequest::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("overloaded"));
    }
}
