//! Timeout and retry policy for external calls.
//!
//! Providers make a single attempt and classify their failures as
//! transient or permanent. [`with_retry`] bounds each attempt with
//! `tokio::time::timeout` and retries transient failures with exponential
//! backoff (1s, 2s, 4s, ... capped at 32s). [`RetryingEmbedder`] and
//! [`RetryingGenerator`] apply the policy to any provider.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use codescope_core::embedding::Embedder;
use codescope_core::error::{EmbeddingError, ModelError};
use codescope_core::generation::{GenerationConfig, Generator};

/// Errors that know whether another attempt may succeed.
pub trait Retryable: Display {
    fn is_retryable(&self) -> bool;

    /// The error recorded when an attempt exceeds its timeout.
    fn timed_out(after: Duration) -> Self;
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn timed_out(after: Duration) -> Self {
        EmbeddingError::transient(format!("embedding request timed out after {:?}", after))
    }
}

impl Retryable for ModelError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn timed_out(after: Duration) -> Self {
        ModelError::transient(format!("generation request timed out after {:?}", after))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Upper bound on a single attempt.
    pub timeout: Duration,
    /// Delay before the first retry; doubled for every further retry.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, timeout_secs: u64) -> Self {
        Self {
            max_retries,
            timeout: Duration::from_secs(timeout_secs),
            base_delay: Duration::from_secs(1),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.timeout)),
        };
        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.backoff(attempt);
                warn!(call = what, attempt, error = %e, "transient failure, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// An [`Embedder`] that applies a [`RetryPolicy`] to every batch.
pub struct RetryingEmbedder {
    inner: Arc<dyn Embedder>,
    policy: RetryPolicy,
}

impl RetryingEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Embedder for RetryingEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let inner = &self.inner;
        with_retry(&self.policy, "embed", move || inner.embed_batch(texts)).await
    }
}

/// A [`Generator`] that applies a [`RetryPolicy`] to every call.
pub struct RetryingGenerator {
    inner: Arc<dyn Generator>,
    policy: RetryPolicy,
}

impl RetryingGenerator {
    pub fn new(inner: Arc<dyn Generator>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Generator for RetryingGenerator {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String, ModelError> {
        let inner = &self.inner;
        with_retry(&self.policy, "generate", move || inner.generate(prompt, config)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            timeout: Duration::from_millis(200),
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, 30);
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(9), Duration::from_secs(32));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ModelError> = with_retry(&fast(3), "test", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ModelError::transient("503"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ModelError> = with_retry(&fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ModelError::permanent("400"))
        })
        .await;
        assert!(!result.unwrap_err().retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<(), EmbeddingError> = with_retry(&fast(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EmbeddingError::transient("429"))
        })
        .await;
        assert!(result.unwrap_err().retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 1,
            timeout: Duration::from_millis(10),
            base_delay: Duration::from_millis(1),
        };
        let result: Result<(), ModelError> = with_retry(&policy, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.retryable);
        assert!(err.message.contains("timed out"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
