//! Text generation providers.
//!
//! - **[`DisabledGenerator`]**: every call fails permanently.
//! - **[`OpenAIGenerator`]**: `POST {url}/v1/chat/completions`, needs `OPENAI_API_KEY`.
//! - **[`OllamaGenerator`]**: `POST {url}/api/chat` with `stream: false`.
//!
//! The role system prompt is sent as the `system` message and the
//! assembled prompt as the single `user` message.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use codescope_core::error::ModelError;
use codescope_core::generation::{GenerationConfig, Generator};

use crate::config::GenerationConfig as GenerationSettings;
use crate::http;
use crate::retry::{RetryPolicy, RetryingGenerator};

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str, _config: &GenerationConfig) -> Result<String, ModelError> {
        Err(ModelError::permanent(
            "generation provider is disabled; set [generation] provider in the config",
        ))
    }
}

fn messages(prompt: &str, config: &GenerationConfig) -> Vec<Value> {
    let mut messages = Vec::with_capacity(2);
    if !config.role_system_prompt.is_empty() {
        messages.push(json!({"role": "system", "content": config.role_system_prompt}));
    }
    messages.push(json!({"role": "user", "content": prompt}));
    messages
}

pub struct OpenAIGenerator {
    model: String,
    url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAIGenerator {
    pub fn new(settings: &GenerationSettings) -> Result<Self> {
        let model = settings
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = settings
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            client: http::client(settings.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": messages(prompt, config),
            "temperature": config.temperature,
            "max_tokens": config.max_output_tokens,
        });
        let response = http::post_json(
            &self.client,
            "OpenAI",
            &format!("{}/v1/chat/completions", self.url),
            Some(&self.api_key),
            &body,
        )
        .await?;
        response
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ModelError::permanent("Invalid OpenAI response: missing message content"))
    }
}

pub struct OllamaGenerator {
    model: String,
    url: String,
    client: reqwest::Client,
}

impl OllamaGenerator {
    pub fn new(settings: &GenerationSettings) -> Result<Self> {
        let model = settings
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        let url = settings
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());
        Ok(Self {
            model,
            url: url.trim_end_matches('/').to_string(),
            client: http::client(settings.timeout_secs)?,
        })
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String, ModelError> {
        let body = json!({
            "model": self.model,
            "messages": messages(prompt, config),
            "stream": false,
            "options": {
                "temperature": config.temperature,
                "num_predict": config.max_output_tokens,
            },
        });
        let response = http::post_json(
            &self.client,
            "Ollama",
            &format!("{}/api/chat", self.url),
            None,
            &body,
        )
        .await?;
        response
            .pointer("/message/content")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ModelError::permanent("Invalid Ollama response: missing message content"))
    }
}

/// Create the configured [`Generator`], wrapped with the retry policy.
pub fn create_generator(settings: &GenerationSettings) -> Result<Arc<dyn Generator>> {
    let provider: Arc<dyn Generator> = match settings.provider.as_str() {
        "disabled" => return Ok(Arc::new(DisabledGenerator)),
        "openai" => Arc::new(OpenAIGenerator::new(settings)?),
        "ollama" => Arc::new(OllamaGenerator::new(settings)?),
        other => bail!("Unknown generation provider: {}", other),
    };
    let policy = RetryPolicy::new(settings.max_retries, settings.timeout_secs);
    Ok(Arc::new(RetryingGenerator::new(provider, policy)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_include_system_prompt_when_set() {
        let mut config = GenerationConfig::default();
        assert_eq!(messages("hi", &config).len(), 1);
        config.role_system_prompt = "You are a reviewer.".to_string();
        let m = messages("hi", &config);
        assert_eq!(m[0]["role"], "system");
        assert_eq!(m[1]["content"], "hi");
    }

    #[tokio::test]
    async fn test_disabled_generator_fails_permanently() {
        let generator = create_generator(&GenerationSettings::default()).unwrap();
        let err = generator
            .generate("hello", &GenerationConfig::default())
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }
}
