//! Retrying, deadline-aware front for a [`ModelProvider`].
//!
//! Embedding input is normalized and truncated to the configured character
//! budget. Every call passes the circuit breaker and then runs attempts under
//! `min(request_timeout, deadline remaining)`. Transient failures are retried
//! with jittered exponential backoff until attempts or the deadline run out;
//! permanent failures return immediately.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use lore_core::config::ProviderConfig;
use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result, TransientKind};
use lore_core::text::{normalize, truncate_chars};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::provider::{CompletionRequest, ModelProvider};
use crate::retry::RetryPolicy;

/// Reported when input text exceeded the character budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TruncationNotice {
    pub original_chars: usize,
    pub kept_chars: usize,
}

impl TruncationNotice {
    pub fn message(&self) -> String {
        format!(
            "input truncated from {} to {} characters before embedding",
            self.original_chars, self.kept_chars
        )
    }
}

/// A vector plus how it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
    pub model: String,
    pub truncated: Option<TruncationNotice>,
}

/// Text ready to send: normalized, non-empty, within budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedText {
    pub text: String,
    pub truncated: Option<TruncationNotice>,
}

pub struct ProviderClient {
    provider: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
    request_timeout: Duration,
    max_input_chars: usize,
    dimension: usize,
}

impl ProviderClient {
    pub fn new(provider: Arc<dyn ModelProvider>, config: &ProviderConfig, dimension: usize) -> Self {
        Self {
            provider,
            policy: RetryPolicy::from(config),
            breaker: CircuitBreaker::from_config(config),
            request_timeout: config.request_timeout(),
            max_input_chars: config.max_input_chars.max(1),
            dimension,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    pub fn model(&self) -> &str {
        self.provider.embedding_model()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Normalize and truncate `text`. Empty input is a validation error.
    pub fn prepare(&self, text: &str) -> Result<PreparedText> {
        let normalized = normalize(text);
        if normalized.is_empty() {
            return Err(LoreError::validation("text must not be empty"));
        }
        let original_chars = normalized.chars().count();
        if original_chars <= self.max_input_chars {
            return Ok(PreparedText {
                text: normalized,
                truncated: None,
            });
        }
        let kept = truncate_chars(&normalized, self.max_input_chars).to_string();
        let notice = TruncationNotice {
            original_chars,
            kept_chars: self.max_input_chars,
        };
        warn!(
            original_chars,
            kept_chars = self.max_input_chars,
            "Provider input truncated"
        );
        Ok(PreparedText {
            text: kept,
            truncated: Some(notice),
        })
    }

    /// Embed `text`, retrying transient failures until `deadline`.
    pub async fn embed(&self, text: &str, deadline: Deadline) -> Result<Embedding> {
        let prepared = self.prepare(text)?;
        let vector = self.embed_prepared(&prepared.text, deadline).await?;
        Ok(Embedding {
            vector,
            model: self.model().to_string(),
            truncated: prepared.truncated,
        })
    }

    /// Embed text that already went through [`prepare`](Self::prepare).
    pub async fn embed_prepared(&self, text: &str, deadline: Deadline) -> Result<Vec<f32>> {
        let provider = Arc::clone(&self.provider);
        let vector = self
            .call("embed", deadline, || {
                let provider = Arc::clone(&provider);
                let text = text.to_string();
                async move { provider.embed(&text).await }
            })
            .await?;
        if vector.len() != self.dimension {
            return Err(LoreError::DimensionMismatch {
                entity: format!("{} embedding", self.provider.name()),
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }

    /// Run a completion. Callers bound the size of what they put in the prompt.
    pub async fn complete(&self, request: &CompletionRequest, deadline: Deadline) -> Result<String> {
        if request.prompt.trim().is_empty() {
            return Err(LoreError::validation("prompt must not be empty"));
        }
        let provider = Arc::clone(&self.provider);
        let request = Arc::new(request.clone());
        self.call("complete", deadline, || {
            let provider = Arc::clone(&provider);
            let request = Arc::clone(&request);
            async move { provider.complete(&request).await }
        })
        .await
    }

    async fn call<T, F, Fut>(&self, op: &'static str, deadline: Deadline, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if deadline.is_expired() {
                return Err(LoreError::transient(
                    TransientKind::Timeout,
                    format!("{} deadline expired before attempt {}", op, attempt),
                ));
            }
            let permit = self.breaker.acquire()?;

            let timeout = deadline.cap(self.request_timeout);
            let outcome = match tokio::time::timeout(timeout, attempt_fn()).await {
                Ok(result) => result,
                Err(_) => Err(LoreError::transient(
                    TransientKind::Timeout,
                    format!("{} attempt timed out after {:?}", op, timeout),
                )),
            };

            let error = match outcome {
                Ok(value) => {
                    permit.record_success();
                    if attempt > 1 {
                        debug!(op, attempt, "Provider call succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };
            permit.record_failure(&error);

            if !error.is_transient() {
                warn!(op, attempt, error = %error, "Provider call failed permanently");
                return Err(error);
            }
            if attempt >= self.policy.max_attempts {
                warn!(op, attempts = attempt, error = %error, "Provider retries exhausted");
                return Err(error);
            }

            let backoff = self.policy.backoff(attempt);
            if let Some(remaining) = deadline.remaining() {
                if remaining <= backoff {
                    warn!(op, attempt, error = %error, "No time left for another provider attempt");
                    return Err(error);
                }
            }
            warn!(
                op,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Transient provider failure, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockProvider, ScriptedFailure};

    const DIM: usize = 16;

    fn config() -> ProviderConfig {
        ProviderConfig {
            kind: "mock".into(),
            max_attempts: 4,
            base_backoff_ms: 10,
            max_backoff_ms: 100,
            breaker_failure_threshold: 3,
            breaker_cooldown_ms: 10_000,
            request_timeout_ms: 1_000,
            max_input_chars: 20,
            ..Default::default()
        }
    }

    fn client(mock: &Arc<MockProvider>) -> ProviderClient {
        ProviderClient::new(mock.clone(), &config(), DIM)
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let mock = Arc::new(MockProvider::new(DIM));
        mock.fail_embed_times(ScriptedFailure::Transient(TransientKind::RateLimited), 2);
        let client = client(&mock);

        let embedding = client.embed("calm", Deadline::none()).await.unwrap();
        assert_eq!(embedding.vector.len(), DIM);
        assert_eq!(mock.embed_calls(), 3);
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let mock = Arc::new(MockProvider::new(DIM));
        mock.fail_embed_always(ScriptedFailure::Permanent);
        let client = client(&mock);

        let err = client.embed("calm", Deadline::none()).await.unwrap_err();
        assert!(matches!(err, LoreError::ProviderPermanent(_)));
        assert_eq!(mock.embed_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_then_breaker_opens() {
        let mock = Arc::new(MockProvider::new(DIM));
        mock.fail_embed_always(ScriptedFailure::Transient(TransientKind::Server));
        let client = client(&mock);

        // Threshold 3 < max_attempts 4: the third failure opens the circuit
        // and the fourth attempt is refused without reaching the provider.
        let err = client.embed("calm", Deadline::none()).await.unwrap_err();
        assert!(matches!(err, LoreError::ProviderUnavailable { .. }));
        assert_eq!(mock.embed_calls(), 3);
        assert_eq!(client.breaker_state(), BreakerState::Open);

        let err = client.embed("calm", Deadline::none()).await.unwrap_err();
        assert!(matches!(err, LoreError::ProviderUnavailable { .. }));
        assert_eq!(mock.embed_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_call_does_not_wedge_breaker() {
        let mock = Arc::new(MockProvider::new(DIM));
        mock.fail_embed_always(ScriptedFailure::Transient(TransientKind::Server));
        let client = client(&mock);
        client.embed("calm", Deadline::none()).await.unwrap_err();
        assert_eq!(client.breaker_state(), BreakerState::Open);

        mock.clear_failures();
        mock.set_latency(Some(Duration::from_secs(5)));
        tokio::time::advance(Duration::from_secs(10)).await;

        // The caller gives up while the probe is still waiting on the provider.
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), client.embed("calm", Deadline::none()))
                .await;
        assert!(abandoned.is_err());
        assert_eq!(client.breaker_state(), BreakerState::HalfOpen);

        mock.set_latency(None);
        let embedding = client.embed("calm", Deadline::none()).await.unwrap();
        assert_eq!(embedding.vector.len(), DIM);
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient_and_bounded_by_deadline() {
        let mock = Arc::new(MockProvider::new(DIM).with_latency(Duration::from_secs(5)));
        let client = client(&mock);

        let start = tokio::time::Instant::now();
        let err = client
            .embed("calm", Deadline::after(Duration::from_millis(1_500)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoreError::ProviderTransient {
                kind: TransientKind::Timeout,
                ..
            }
        ));
        assert!(start.elapsed() <= Duration::from_millis(1_600));
    }

    #[tokio::test]
    async fn test_empty_input_is_validation_error() {
        let mock = Arc::new(MockProvider::new(DIM));
        let client = client(&mock);
        let err = client.embed(" \n\t ", Deadline::none()).await.unwrap_err();
        assert!(matches!(err, LoreError::Validation(_)));
        assert_eq!(mock.embed_calls(), 0);
    }

    #[tokio::test]
    async fn test_long_input_truncated_and_reported() {
        let mock = Arc::new(MockProvider::new(DIM));
        let client = client(&mock);
        let long = "李青".repeat(30);
        let embedding = client.embed(&long, Deadline::none()).await.unwrap();
        let notice = embedding.truncated.unwrap();
        assert_eq!(notice.original_chars, 60);
        assert_eq!(notice.kept_chars, 20);
        assert_eq!(embedding.vector, mock.vector_for(&"李青".repeat(10)));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_from_provider() {
        let mock = Arc::new(MockProvider::new(DIM + 1));
        let client = client(&mock);
        let err = client.embed("calm", Deadline::none()).await.unwrap_err();
        assert!(matches!(
            err,
            LoreError::DimensionMismatch {
                expected: DIM,
                actual: 17,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_complete_passes_through() {
        let mock = Arc::new(MockProvider::new(DIM).with_completion("hello", "world"));
        let client = client(&mock);
        let out = client
            .complete(&CompletionRequest::new("hello"), Deadline::none())
            .await
            .unwrap();
        assert_eq!(out, "world");
    }
}
