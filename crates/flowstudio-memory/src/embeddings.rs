use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use flowstudio_core::config::EmbeddingConfig;
use flowstudio_core::error::{FlowError, Result};

/// Turns text into vectors for similarity search.
pub trait EmbeddingProvider: Send + Sync + 'static {
    /// Embed a batch of texts into vectors.
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>>;
    /// Number of dimensions in the embedding vectors.
    fn dimensions(&self) -> usize;
}

/// HTTP embedding provider for OpenAI-compatible `/embeddings` endpoints.
pub struct HttpEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dims: usize,
}

impl HttpEmbeddingProvider {
    pub fn new(base_url: &str, api_key: Option<&str>, model: &str, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(String::from),
            model: model.to_string(),
            dims,
        }
    }

    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let default_url = match config.provider.as_str() {
            "ollama" => "http://localhost:11434/v1",
            _ => "https://api.openai.com/v1",
        };
        Self::new(
            config.base_url.as_deref().unwrap_or(default_url),
            config.api_key.as_deref(),
            &config.model,
            config.dimensions,
        )
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl EmbeddingProvider for HttpEmbeddingProvider {
    fn embed(&self, texts: &[String]) -> BoxFuture<'_, Result<Vec<Vec<f32>>>> {
        let texts = texts.to_vec();
        Box::pin(async move {
            let url = format!("{}/embeddings", self.base_url);

            let mut req = self.client.post(&url).json(&EmbeddingRequest {
                model: self.model.clone(),
                input: texts,
            });

            if let Some(ref key) = self.api_key {
                req = req.bearer_auth(key);
            }

            let resp = req
                .send()
                .await
                .map_err(|e| FlowError::Retrieval(format!("Embedding request failed: {}", e)))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(FlowError::Retrieval(format!(
                    "Embedding API error {}: {}",
                    status, body
                )));
            }

            let body: EmbeddingResponse = resp.json().await.map_err(|e| {
                FlowError::Retrieval(format!("Failed to parse embedding response: {}", e))
            })?;

            Ok(body.data.into_iter().map(|d| d.embedding).collect())
        })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Encode a vector as a little-endian BLOB.
pub(crate) fn to_blob(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn from_blob(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
