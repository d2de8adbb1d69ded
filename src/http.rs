//! JSON-over-HTTP calls shared by the embedding and generation providers.
//!
//! Failure classification:
//! - HTTP 429 (rate limited) and 5xx (server error) → transient
//! - other HTTP 4xx → permanent
//! - network and timeout errors → transient
//! - a success response with an unparseable body → permanent

use std::time::Duration;

use codescope_core::error::{EmbeddingError, ModelError};

/// A failed provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpFailure {
    pub message: String,
    pub retryable: bool,
}

impl From<HttpFailure> for EmbeddingError {
    fn from(f: HttpFailure) -> Self {
        EmbeddingError {
            message: f.message,
            retryable: f.retryable,
        }
    }
}

impl From<HttpFailure> for ModelError {
    fn from(f: HttpFailure) -> Self {
        ModelError {
            message: f.message,
            retryable: f.retryable,
        }
    }
}

pub fn client(timeout_secs: u64) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()?)
}

/// Whether a non-success status may succeed on retry.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// POST `body` to `url` and parse the JSON response.
pub async fn post_json(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
) -> Result<serde_json::Value, HttpFailure> {
    let mut request = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(body);
    if let Some(token) = bearer {
        request = request.header("Authorization", format!("Bearer {}", token));
    }

    let response = request.send().await.map_err(|e| HttpFailure {
        message: format!("{} connection error ({}): {}", provider, url, e),
        retryable: true,
    })?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(HttpFailure {
            message: format!("{} API error {}: {}", provider, status, body_text),
            retryable: is_retryable_status(status.as_u16()),
        });
    }

    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| HttpFailure {
            message: format!("{} returned an invalid body: {}", provider, e),
            retryable: false,
        })
}

/// Parse a JSON array of numbers into a vector.
pub fn parse_vector(value: &serde_json::Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_parse_vector_rejects_non_numbers() {
        assert_eq!(parse_vector(&json!([1, 0.5])), Some(vec![1.0, 0.5]));
        assert_eq!(parse_vector(&json!([1, "x"])), None);
        assert_eq!(parse_vector(&json!({"a": 1})), None);
    }

    #[test]
    fn test_failure_conversions_keep_retryable() {
        let f = HttpFailure {
            message: "x".into(),
            retryable: true,
        };
        assert!(EmbeddingError::from(f.clone()).retryable);
        assert!(ModelError::from(f).retryable);
    }
}
