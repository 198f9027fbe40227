pub mod ollama;
pub mod openai;
pub mod presets;

pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
