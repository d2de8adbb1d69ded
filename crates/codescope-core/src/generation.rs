//! The external text-generation capability.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelError;

/// Options recognized by every [`Generator`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens.
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// System prompt describing the role the model plays for this call.
    pub role_system_prompt: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 3000,
            temperature: 0.3,
            role_system_prompt: String::new(),
        }
    }
}

/// `generate(prompt, config) -> text`.
///
/// Implementations make a single attempt and classify failures through
/// [`ModelError::retryable`]. Retry and timeout policy belongs to the
/// caller.
#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String, ModelError>;
}
