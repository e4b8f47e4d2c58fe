//! Deterministic in-process provider for tests and offline runs.
//!
//! Embeddings put weight on a small set of concept axes (a text mentioning
//! "冷静" or "calm" lands near every other text that does) plus a hashed
//! character-bigram component, then L2-normalize. Completions come from
//! substring-matched scripts. Failures and latency can be scripted at runtime.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use lore_core::error::{LoreError, Result, TransientKind};

use super::{CompletionRequest, ModelProvider};

/// Built-in concept axes: each entry is one axis and the keywords that
/// activate it.
const DEFAULT_CONCEPTS: &[&[&str]] = &[
    &["冷静", "镇定", "沉着", "calm", "composed", "collected"],
    &["果断", "决断", "decisive", "resolute"],
    &["勇敢", "无畏", "brave", "courage", "fearless"],
    &["忠诚", "loyal", "faithful"],
    &["狡猾", "cunning", "sly", "scheming"],
    &["剑", "sword", "blade", "fencing"],
    &["魔法", "法术", "magic", "spell", "wizard"],
    &["帮派", "青帮", "gang", "triad"],
    &["善良", "温柔", "kind", "gentle"],
    &["暴躁", "愤怒", "angry", "temper"],
    &["弓", "archery", "bow", "archer"],
    &["商人", "merchant", "trade"],
];

/// Share of the vector norm given to the hashed component when at least one
/// concept matched.
const NOISE_WEIGHT: f32 = 0.3;

/// A scripted provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    Transient(TransientKind),
    Permanent,
}

impl ScriptedFailure {
    fn to_error(self, op: &str) -> LoreError {
        match self {
            ScriptedFailure::Transient(kind) => {
                LoreError::transient(kind, format!("scripted {} failure", op))
            }
            ScriptedFailure::Permanent => {
                LoreError::ProviderPermanent(format!("scripted {} failure", op))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureScript {
    failure: ScriptedFailure,
    /// `None` fails forever.
    remaining: Option<usize>,
}

/// Deterministic [`ModelProvider`].
pub struct MockProvider {
    dimension: usize,
    model: String,
    concepts: Vec<Vec<String>>,
    completions: Mutex<Vec<(String, String)>>,
    default_completion: String,
    embed_failure: Mutex<Option<FailureScript>>,
    complete_failure: Mutex<Option<FailureScript>>,
    latency: Mutex<Option<Duration>>,
    embed_calls: AtomicUsize,
    complete_calls: AtomicUsize,
}

impl MockProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model: "mock-embedding".to_string(),
            concepts: DEFAULT_CONCEPTS
                .iter()
                .map(|words| words.iter().map(|w| w.to_string()).collect())
                .collect(),
            completions: Mutex::new(Vec::new()),
            default_completion: "[]".to_string(),
            embed_failure: Mutex::new(None),
            complete_failure: Mutex::new(None),
            latency: Mutex::new(None),
            embed_calls: AtomicUsize::new(0),
            complete_calls: AtomicUsize::new(0),
        }
    }

    /// Report a different embedding model id (changes every fingerprint).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Add a concept axis activated by any of `keywords`.
    pub fn with_concept<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.concepts
            .push(keywords.into_iter().map(|k| k.into().to_lowercase()).collect());
        self
    }

    /// Answer completions whose system or user text contains `needle`.
    ///
    /// Rules are checked in insertion order.
    pub fn with_completion(self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.script_completion(needle, response);
        self
    }

    /// Response used when no completion rule matches.
    pub fn with_default_completion(mut self, response: impl Into<String>) -> Self {
        self.default_completion = response.into();
        self
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(Some(latency));
        self
    }

    pub fn script_completion(&self, needle: impl Into<String>, response: impl Into<String>) {
        lock(&self.completions).push((needle.into(), response.into()));
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        *lock(&self.latency) = latency;
    }

    /// Fail the next `times` embed calls.
    pub fn fail_embed_times(&self, failure: ScriptedFailure, times: usize) {
        *lock(&self.embed_failure) = Some(FailureScript {
            failure,
            remaining: Some(times),
        });
    }

    /// Fail every embed call until [`clear_failures`](Self::clear_failures).
    pub fn fail_embed_always(&self, failure: ScriptedFailure) {
        *lock(&self.embed_failure) = Some(FailureScript {
            failure,
            remaining: None,
        });
    }

    pub fn fail_complete_times(&self, failure: ScriptedFailure, times: usize) {
        *lock(&self.complete_failure) = Some(FailureScript {
            failure,
            remaining: Some(times),
        });
    }

    pub fn fail_complete_always(&self, failure: ScriptedFailure) {
        *lock(&self.complete_failure) = Some(FailureScript {
            failure,
            remaining: None,
        });
    }

    pub fn clear_failures(&self) {
        *lock(&self.embed_failure) = None;
        *lock(&self.complete_failure) = None;
    }

    /// Embed calls received, failed ones included.
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Completion calls received, failed ones included.
    pub fn complete_calls(&self) -> usize {
        self.complete_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.embed_calls.store(0, Ordering::SeqCst);
        self.complete_calls.store(0, Ordering::SeqCst);
    }

    /// The vector [`embed`](ModelProvider::embed) returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut vector = vec![0.0f32; self.dimension];

        let mut matched = false;
        for (axis, keywords) in self.concepts.iter().enumerate() {
            if keywords.iter().any(|k| lower.contains(k.as_str())) {
                vector[axis % self.dimension] += 1.0;
                matched = true;
            }
        }

        let mut noise = vec![0.0f32; self.dimension];
        let chars: Vec<char> = lower.chars().filter(|c| !c.is_whitespace()).collect();
        let grams: Vec<String> = if chars.len() < 2 {
            chars.iter().map(|c| c.to_string()).collect()
        } else {
            chars.windows(2).map(|w| w.iter().collect()).collect()
        };
        let reserved = self.concepts.len().min(self.dimension.saturating_sub(1));
        let span = (self.dimension - reserved).max(1);
        for gram in grams {
            let mut hasher = DefaultHasher::new();
            gram.hash(&mut hasher);
            let h = hasher.finish();
            let axis = (reserved + (h as usize % span)) % self.dimension;
            noise[axis] += if h >> 63 == 1 { 1.0 } else { -1.0 };
        }

        let noise_norm = l2_norm(&noise);
        if noise_norm > 0.0 {
            let scale = if matched { NOISE_WEIGHT } else { 1.0 } / noise_norm;
            for (v, n) in vector.iter_mut().zip(&noise) {
                *v += n * scale;
            }
        }

        let norm = l2_norm(&vector);
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    async fn simulate_latency(&self) {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_failure(script: &Mutex<Option<FailureScript>>) -> Option<ScriptedFailure> {
        let mut guard = lock(script);
        let current = (*guard)?;
        match current.remaining {
            None => Some(current.failure),
            Some(0) => {
                *guard = None;
                None
            }
            Some(n) => {
                *guard = if n == 1 {
                    None
                } else {
                    Some(FailureScript {
                        remaining: Some(n - 1),
                        ..current
                    })
                };
                Some(current.failure)
            }
        }
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn embedding_model(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(failure) = Self::take_failure(&self.embed_failure) {
            return Err(failure.to_error("embed"));
        }
        if text.trim().is_empty() {
            return Err(LoreError::ProviderPermanent("cannot embed empty text".into()));
        }
        Ok(self.vector_for(text))
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        self.complete_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;
        if let Some(failure) = Self::take_failure(&self.complete_failure) {
            return Err(failure.to_error("completion"));
        }
        let system = request.system.as_deref().unwrap_or_default();
        let rules = lock(&self.completions);
        Ok(rules
            .iter()
            .find(|(needle, _)| request.prompt.contains(needle) || system.contains(needle))
            .map(|(_, response)| response.clone())
            .unwrap_or_else(|| self.default_completion.clone()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic_unit_vectors() {
        let mock = MockProvider::new(64);
        let a = mock.embed("李青在面对危险时总是保持冷静").await.unwrap();
        let b = mock.embed("李青在面对危险时总是保持冷静").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
        assert_eq!(mock.embed_calls(), 2);
    }

    #[test]
    fn test_shared_concept_is_similar() {
        let mock = MockProvider::new(64);
        let query = mock.vector_for("冷静的人物");
        let fact = mock.vector_for("李青在面对危险时总是保持冷静");
        let other = mock.vector_for("王五擅长用剑");
        assert!(cosine(&query, &fact) > 0.7);
        assert!(cosine(&query, &other) < 0.3);
    }

    #[test]
    fn test_custom_concept() {
        let mock = MockProvider::new(32).with_concept(["dragon", "wyrm"]);
        let a = mock.vector_for("an old Dragon");
        let b = mock.vector_for("the wyrm sleeps");
        assert!(cosine(&a, &b) > 0.7);
    }

    #[tokio::test]
    async fn test_scripted_failures_count_down() {
        let mock = MockProvider::new(8);
        mock.fail_embed_times(ScriptedFailure::Transient(TransientKind::RateLimited), 2);
        assert!(mock.embed("a").await.unwrap_err().is_transient());
        assert!(mock.embed("a").await.unwrap_err().is_transient());
        assert!(mock.embed("a").await.is_ok());

        mock.fail_embed_always(ScriptedFailure::Permanent);
        for _ in 0..3 {
            assert!(matches!(
                mock.embed("a").await.unwrap_err(),
                LoreError::ProviderPermanent(_)
            ));
        }
        mock.clear_failures();
        assert!(mock.embed("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_completion_failures_count_down() {
        let mock = MockProvider::new(8)
            .with_model("mock-embed-v2")
            .with_default_completion("ok");
        assert_eq!(mock.embedding_model(), "mock-embed-v2");

        mock.fail_complete_times(ScriptedFailure::Permanent, 1);
        let req = CompletionRequest::new("hi");
        assert!(matches!(
            mock.complete(&req).await.unwrap_err(),
            LoreError::ProviderPermanent(_)
        ));
        assert_eq!(mock.complete(&req).await.unwrap(), "ok");
        // Embeddings are unaffected by completion scripts.
        assert!(mock.embed("a").await.is_ok());
    }

    #[tokio::test]
    async fn test_scripted_completions() {
        let mock = MockProvider::new(8)
            .with_completion("tags", r#"["brave"]"#)
            .with_default_completion("{}");
        let hit = mock
            .complete(&CompletionRequest::new("generate tags please"))
            .await
            .unwrap();
        assert_eq!(hit, r#"["brave"]"#);
        let miss = mock.complete(&CompletionRequest::new("hello")).await.unwrap();
        assert_eq!(miss, "{}");

        let by_system = mock
            .complete(&CompletionRequest::new("x").with_system("you write tags"))
            .await
            .unwrap();
        assert_eq!(by_system, r#"["brave"]"#);
        assert_eq!(mock.complete_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency() {
        let mock = MockProvider::new(8).with_latency(Duration::from_millis(250));
        let start = tokio::time::Instant::now();
        mock.embed("a").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
