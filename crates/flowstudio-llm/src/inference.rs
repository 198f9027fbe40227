use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::debug;

use flowstudio_core::config::ModelConfig;
use flowstudio_core::error::{FlowError, Result};
use flowstudio_core::traits::{InferenceBackend, LlmClient};
use flowstudio_core::types::*;

use crate::providers::openai::image_block;

/// Inference backend on top of a chat client.
///
/// Per-call settings override the configured model; history becomes prior chat turns.
pub struct LlmInference {
    client: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl LlmInference {
    pub fn new(client: Arc<dyn LlmClient>, model: ModelConfig) -> Self {
        Self { client, model }
    }

    pub fn client(&self) -> Arc<dyn LlmClient> {
        self.client.clone()
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }
}

/// Merge node-level settings onto the configured model.
pub fn effective_config(base: &ModelConfig, settings: &InferenceSettings) -> ModelConfig {
    let mut config = base.clone();
    if let Some(model) = settings.model.as_ref().filter(|m| !m.is_empty()) {
        config.model_id = model.clone();
    }
    if let Some(url) = settings.base_url.as_ref().filter(|u| !u.is_empty()) {
        config.base_url = Some(url.clone());
    }
    if let Some(t) = settings.temperature {
        config.temperature = t;
    }
    if let Some(max) = settings.max_tokens {
        config.max_tokens = max;
    }
    if settings.num_ctx.is_some() {
        config.num_ctx = settings.num_ctx;
    }
    for (k, v) in &settings.options {
        config.options.insert(k.clone(), v.clone());
    }
    config
}

/// Build the chat transcript for one prompt.
pub fn build_messages(request: &GenerateRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.history.len() + 2);
    if let Some(system) = request.system_prompt.as_ref().filter(|s| !s.trim().is_empty()) {
        messages.push(ChatMessage::system(system.clone()));
    }
    for past in &request.history {
        match past.role {
            Role::Assistant => messages.push(ChatMessage::assistant_text(past.content.clone())),
            Role::User => messages.push(ChatMessage::user(past.content.clone())),
            _ => {}
        }
    }

    let mut prompt = ChatMessage::user(request.prompt.clone());
    for image in &request.images {
        prompt.content.push(image_block(&image.media_type, &image.data));
    }
    messages.push(prompt);
    messages
}

impl InferenceBackend for LlmInference {
    fn generate(&self, request: GenerateRequest) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let config = effective_config(&self.model, &request.settings);
            let chat = ChatRequest {
                messages: build_messages(&request),
                tools: vec![],
                json_mode: request.settings.json_mode,
            };

            debug!(
                model = %config.model_id,
                history = request.history.len(),
                images = request.images.len(),
                "Generating completion"
            );

            let timeout = Duration::from_secs(config.timeout_secs);
            let response = tokio::time::timeout(timeout, self.client.chat(&config, chat))
                .await
                .map_err(|_| {
                    FlowError::LlmRequest(format!("timeout after {}s", config.timeout_secs))
                })??;

            Ok(response.message.text())
        })
    }
}
