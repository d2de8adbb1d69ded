//! Embedding providers.
//!
//! Implementations of [`Embedder`]:
//! - **[`DisabledEmbedder`]**: zero dimensions; every call fails permanently.
//! - **[`OpenAIEmbedder`]**: `POST {url}/v1/embeddings`, needs `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST {url}/api/embed` on a local Ollama instance.
//!
//! Each call is a single attempt. [`create_embedder`] wraps the provider
//! in a [`RetryingEmbedder`] configured from `[embedding]`.
//!
//! ```rust,no_run
//! # use codescope::config::EmbeddingConfig;
//! # use codescope::embedding::create_embedder;
//! # use codescope_core::embedding::Embedder;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let embedder = create_embedder(&config).unwrap();
//! assert_eq!(embedder.model_name(), "disabled");
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use codescope_core::embedding::Embedder;
use codescope_core::error::EmbeddingError;

use crate::config::EmbeddingConfig;
use crate::http::{self, parse_vector};
use crate::retry::{RetryPolicy, RetryingEmbedder};

// ============ Disabled Provider ============

/// Used when `embedding.provider = "disabled"`.
pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::permanent("embedding provider is disabled"))
    }
}

// ============ OpenAI Provider ============

pub struct OpenAIEmbedder {
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OpenAIEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = json!({
            "model": self.model,
            "input": texts,
        });
        let response = http::post_json(
            &self.client,
            "OpenAI",
            &format!("{}/v1/embeddings", self.url),
            Some(&self.api_key),
            &body,
        )
        .await?;
        parse_openai_response(&response, texts.len())
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbeddingError::permanent("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        let vector = item
            .get("embedding")
            .and_then(parse_vector)
            .ok_or_else(|| EmbeddingError::permanent("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);

    let vectors: Vec<Vec<f32>> = indexed.into_iter().map(|(_, v)| v).collect();
    check_count(vectors, expected)
}

// ============ Ollama Provider ============

/// Requires Ollama to be running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            client: http::client(config.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let body = json!({
            "model": self.model,
            "input": texts,
        });
        let response = http::post_json(
            &self.client,
            "Ollama",
            &format!("{}/api/embed", self.url),
            None,
            &body,
        )
        .await?;
        parse_ollama_response(&response, texts.len())
    }
}

fn parse_ollama_response(json: &Value, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| EmbeddingError::permanent("Invalid Ollama response: missing embeddings array"))?;

    let vectors = embeddings
        .iter()
        .map(|e| {
            parse_vector(e).ok_or_else(|| {
                EmbeddingError::permanent("Invalid Ollama response: embedding is not an array")
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    check_count(vectors, expected)
}

fn check_count(vectors: Vec<Vec<f32>>, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    if vectors.len() != expected {
        return Err(EmbeddingError::permanent(format!(
            "provider returned {} vectors for {} inputs",
            vectors.len(),
            expected
        )));
    }
    Ok(vectors)
}

/// Create the configured [`Embedder`], wrapped with the retry policy.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] (not wrapped) |
/// | `"openai"` | [`OpenAIEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let provider: Arc<dyn Embedder> = match config.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledEmbedder)),
        "openai" => Arc::new(OpenAIEmbedder::new(config)?),
        "ollama" => Arc::new(OllamaEmbedder::new(config)?),
        other => bail!("Unknown embedding provider: {}", other),
    };
    let policy = RetryPolicy::new(config.max_retries, config.timeout_secs);
    Ok(Arc::new(RetryingEmbedder::new(provider, policy)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_response_is_ordered_by_index() {
        let body = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&body, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_malformed_responses_are_permanent() {
        let err = parse_openai_response(&json!({"error": "x"}), 1).unwrap_err();
        assert!(!err.retryable);
        let err = parse_ollama_response(&json!({"embeddings": [[1.0]]}), 2).unwrap_err();
        assert!(!err.retryable);
        assert!(err.message.contains("1 vectors for 2 inputs"));
    }

    #[test]
    fn test_ollama_response() {
        let body = json!({"embeddings": [[0.5, 0.5], [1, 0]]});
        assert_eq!(
            parse_ollama_response(&body, 2).unwrap(),
            vec![vec![0.5, 0.5], vec![1.0, 0.0]]
        );
    }

    #[tokio::test]
    async fn test_disabled_embedder() {
        let embedder = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert!(!embedder.is_enabled());
        let err = embedder.embed("hello").await.unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn test_unknown_provider() {
        let config = EmbeddingConfig {
            provider: "cohere".to_string(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
