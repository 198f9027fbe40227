pub mod inference;
pub mod providers;
pub mod retry;

use flowstudio_core::config::AppConfig;
use flowstudio_core::config::ModelConfig;
use flowstudio_core::traits::LlmClient;

pub use inference::LlmInference;
pub use providers::ollama::OllamaClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Box<dyn LlmClient> {
    match config.provider.as_str() {
        "ollama" => Box::new(OllamaClient::new()),
        // Everything else speaks the OpenAI chat completions protocol
        _ => Box::new(OpenAiClient::new()),
    }
}

/// Create the configured client wrapped with retries and fallback models.
pub fn create_retrying_client(config: &AppConfig) -> Box<dyn LlmClient> {
    let fallbacks = config
        .fallback_models
        .iter()
        .map(|fb| (fb.clone(), create_client(fb)))
        .collect();
    Box::new(RetryingClient::new(
        create_client(&config.model),
        fallbacks,
        config.model.retry.clone().unwrap_or_default(),
    ))
}
