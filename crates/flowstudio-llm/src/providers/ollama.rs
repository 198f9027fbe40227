use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use flowstudio_core::config::ModelConfig;
use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::LlmClient;
use flowstudio_core::types::*;

const OLLAMA_URL: &str = "http://localhost:11434";

/// Native Ollama `/api/chat` client.
///
/// Supports `num_ctx`, free-form `options`, base64 images, and JSON format mode.
pub struct OllamaClient {
    http: Client,
}

impl OllamaClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OllamaClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<OllamaToolCall>,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaToolCall {
    function: OllamaFunction,
}

#[derive(Serialize, Deserialize, Debug)]
struct OllamaFunction {
    name: String,
    #[serde(default)]
    arguments: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    message: OllamaMessage,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

fn convert_messages(messages: Vec<ChatMessage>) -> Vec<OllamaMessage> {
    let mut out = Vec::new();
    for msg in messages {
        if msg.role == Role::Tool {
            for block in &msg.content {
                if let ContentBlock::ToolResult { content, .. } = block {
                    out.push(OllamaMessage {
                        role: "tool".into(),
                        content: content.clone(),
                        ..OllamaMessage::default()
                    });
                }
            }
            continue;
        }

        let images = msg
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Image { data, .. } => Some(data.clone()),
                _ => None,
            })
            .collect();
        let tool_calls = msg
            .tool_uses()
            .into_iter()
            .map(|(_, name, input)| OllamaToolCall {
                function: OllamaFunction {
                    name: name.to_string(),
                    arguments: input.clone(),
                },
            })
            .collect();

        out.push(OllamaMessage {
            role: msg.role.as_str().to_string(),
            content: msg.text(),
            images,
            tool_calls,
        });
    }
    out
}

fn options(config: &ModelConfig) -> serde_json::Map<String, serde_json::Value> {
    let mut opts = config.options.clone();
    opts.entry("temperature")
        .or_insert_with(|| serde_json::json!(config.temperature));
    opts.entry("num_predict")
        .or_insert_with(|| serde_json::json!(config.max_tokens));
    if let Some(num_ctx) = config.num_ctx {
        opts.insert("num_ctx".into(), serde_json::json!(num_ctx));
    }
    opts
}

impl LlmClient for OllamaClient {
    fn chat(&self, config: &ModelConfig, request: ChatRequest) -> BoxFuture<'_, Result<ChatResponse>> {
        let config = config.clone();

        Box::pin(async move {
            let base = config.base_url.as_deref().unwrap_or(OLLAMA_URL);
            let url = format!("{}/api/chat", base.trim_end_matches('/'));

            let body = OllamaRequest {
                model: config.model_id.clone(),
                messages: convert_messages(request.messages),
                stream: false,
                options: options(&config),
                format: request.json_mode.then(|| "json".to_string()),
                tools: request
                    .tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.input_schema,
                            }
                        })
                    })
                    .collect(),
            };

            debug!(url = %url, model = %config.model_id, "Sending Ollama chat");

            let response = self
                .http
                .post(&url)
                .json(&body)
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

            let parsed: OllamaResponse = response
                .json()
                .await
                .map_err(|e| FlowError::LlmParse(e.to_string()))?;

            let mut content = Vec::new();
            if !parsed.message.content.is_empty() {
                content.push(ContentBlock::Text {
                    text: parsed.message.content,
                });
            }
            let has_tools = !parsed.message.tool_calls.is_empty();
            for (i, call) in parsed.message.tool_calls.into_iter().enumerate() {
                content.push(ContentBlock::ToolUse {
                    id: format!("call_{i}"),
                    name: call.function.name,
                    input: call.function.arguments,
                });
            }

            let stop_reason = if has_tools {
                StopReason::ToolUse
            } else if parsed.done_reason.as_deref() == Some("length") {
                StopReason::MaxTokens
            } else {
                StopReason::EndTurn
            };

            Ok(ChatResponse {
                message: ChatMessage {
                    role: Role::Assistant,
                    content,
                },
                stop_reason,
                usage: Usage {
                    input_tokens: parsed.prompt_eval_count,
                    output_tokens: parsed.eval_count,
                },
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> ModelConfig {
        ModelConfig {
            provider: "ollama".into(),
            model_id: "gemma3:12b".into(),
            base_url: Some(base_url),
            num_ctx: Some(8192),
            temperature: 0.1,
            ..ModelConfig::default()
        }
    }

    #[test]
    fn test_options_keep_user_values() {
        let mut cfg = config("http://x".into());
        cfg.options.insert("temperature".into(), serde_json::json!(0.9));
        let opts = options(&cfg);
        assert_eq!(opts["temperature"], serde_json::json!(0.9));
        assert_eq!(opts["num_ctx"], serde_json::json!(8192));
        assert_eq!(opts["num_predict"], serde_json::json!(2048));
    }

    #[tokio::test]
    async fn test_chat_sends_native_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .and(body_partial_json(serde_json::json!({
                "model": "gemma3:12b",
                "stream": false,
                "format": "json",
                "options": {"num_ctx": 8192}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "{\"ok\":true}"},
                "done_reason": "stop",
                "prompt_eval_count": 11,
                "eval_count": 4
            })))
            .mount(&server)
            .await;

        let resp = OllamaClient::new()
            .chat(
                &config(server.uri()),
                ChatRequest {
                    messages: vec![ChatMessage::system("be terse"), ChatMessage::user("hi")],
                    tools: vec![],
                    json_mode: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(resp.message.text(), "{\"ok\":true}");
        assert_eq!(resp.usage.input_tokens, 11);
    }

    #[tokio::test]
    async fn test_chat_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{"function": {"name": "web_fetch", "arguments": {"url": "https://a.b"}}}]
                }
            })))
            .mount(&server)
            .await;

        let resp = OllamaClient::new()
            .chat(&config(server.uri()), ChatRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.message.tool_uses()[0].2["url"], "https://a.b");
    }
}
