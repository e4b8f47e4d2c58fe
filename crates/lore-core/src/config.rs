use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{LoreError, Result};

/// Top-level configuration for the lore knowledge base.
///
/// Loaded once at startup and then treated as immutable. Components receive
/// the section they need at construction time; nothing reads configuration
/// from a global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoreConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tags: TagConfig,
    #[serde(default)]
    pub relationships: RelationshipConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl LoreConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LoreConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(LoreError::Config("embedding.dimension must be > 0".into()));
        }
        if self.storage.pool_size == 0 {
            return Err(LoreError::Config("storage.pool_size must be > 0".into()));
        }
        if self.provider.max_attempts == 0 {
            return Err(LoreError::Config("provider.max_attempts must be > 0".into()));
        }
        if self.provider.max_input_chars == 0 {
            return Err(LoreError::Config(
                "provider.max_input_chars must be > 0".into(),
            ));
        }
        if !matches!(self.provider.kind.as_str(), "openai" | "mock") {
            return Err(LoreError::Config(format!(
                "provider.kind must be 'openai' or 'mock', got '{}'",
                self.provider.kind
            )));
        }
        self.search.validate()?;
        if self.tags.default_confidence.is_nan()
            || !(0.0..=1.0).contains(&self.tags.default_confidence)
        {
            return Err(LoreError::Config(
                "tags.default_confidence must be within [0, 1]".into(),
            ));
        }
        if self.relationships.max_depth == 0 {
            return Err(LoreError::Config(
                "relationships.max_depth must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    pub data_dir: String,
    /// HTTP port for the tool surface.
    pub port: u16,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            port: 8450,
            log_level: "info".to_string(),
        }
    }
}

/// External model provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Provider backend: "openai" (any OpenAI-compatible endpoint) or "mock".
    pub kind: String,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// API key. Falls back to `LORE_API_KEY`, then `OPENAI_API_KEY`.
    pub api_key: Option<String>,
    /// Model used for tag generation and relationship reasoning.
    pub chat_model: String,
    /// Model used for embeddings.
    pub embedding_model: String,
    /// Per-attempt timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Character budget for a single provider input; longer text is truncated.
    pub max_input_chars: usize,
    /// Sampling temperature for completions.
    pub temperature: f32,
    /// Attempts per call, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt, doubled after each further attempt.
    pub base_backoff_ms: u64,
    /// Upper bound on a single backoff sleep.
    pub max_backoff_ms: u64,
    /// Consecutive transient failures that open the circuit.
    pub breaker_failure_threshold: u32,
    /// How long an open circuit rejects calls before admitting a probe.
    pub breaker_cooldown_ms: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            request_timeout_ms: 30_000,
            max_input_chars: 8_000,
            temperature: 0.7,
            max_attempts: 4,
            base_backoff_ms: 200,
            max_backoff_ms: 5_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key: config value, then `LORE_API_KEY`, then `OPENAI_API_KEY`.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var("LORE_API_KEY").ok().filter(|k| !k.is_empty()))
            .or_else(|| std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

/// Embedding dimension and cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Fixed vector dimension D. Changing it requires a full re-embedding pass.
    pub dimension: usize,
    /// Maximum number of cached vectors.
    pub cache_capacity: usize,
    /// Cache entry lifetime in seconds. 0 disables expiry.
    pub cache_ttl_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            cache_capacity: 10_000,
            cache_ttl_secs: 86_400,
        }
    }
}

impl EmbeddingConfig {
    pub fn cache_ttl(&self) -> Option<Duration> {
        (self.cache_ttl_secs > 0).then(|| Duration::from_secs(self.cache_ttl_secs))
    }
}

/// Hybrid search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default number of results.
    pub default_limit: usize,
    /// Maximum number of results a caller may request.
    pub max_limit: usize,
    /// Similarity floor applied when the caller does not pass one.
    pub default_similarity_threshold: f64,
    /// Weight of the cosine similarity term.
    pub vector_weight: f64,
    /// Weight of the trigram lexical term.
    pub lexical_weight: f64,
    /// Weight of the tag overlap term.
    pub tag_weight: f64,
    /// Vector candidates fetched per requested result.
    pub candidate_multiplier: usize,
    /// Minimum trigram coverage for a lexical candidate.
    pub min_lexical_score: f64,
    /// Deadline for a whole tool call, in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 100,
            default_similarity_threshold: 0.25,
            vector_weight: 0.7,
            lexical_weight: 0.2,
            tag_weight: 0.1,
            candidate_multiplier: 4,
            min_lexical_score: 0.3,
            call_timeout_ms: 20_000,
        }
    }
}

impl SearchConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let weights = [self.vector_weight, self.lexical_weight, self.tag_weight];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(LoreError::Config(
                "search weights must be finite and non-negative".into(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(LoreError::Config(
                "at least one search weight must be positive".into(),
            ));
        }
        if self.max_limit == 0 || self.default_limit == 0 || self.default_limit > self.max_limit
        {
            return Err(LoreError::Config(
                "search limits must satisfy 0 < default_limit <= max_limit".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.default_similarity_threshold) {
            return Err(LoreError::Config(
                "search.default_similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.candidate_multiplier == 0 {
            return Err(LoreError::Config(
                "search.candidate_multiplier must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Storage, connection pool and vector index configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name inside `general.data_dir`.
    pub database_file: String,
    /// Maximum open SQLite connections.
    pub pool_size: usize,
    /// How long a caller waits for a free connection.
    pub acquire_timeout_ms: u64,
    /// SQLite busy timeout for lock waits inside a statement.
    pub busy_timeout_ms: u64,
    /// Below this many vectors the index scans exhaustively.
    pub ivf_min_vectors: usize,
    /// Number of IVF partitions. 0 means `sqrt(n)`.
    pub ivf_lists: usize,
    /// Partitions scanned per query. Higher means better recall, slower queries.
    pub ivf_probes: usize,
    /// k-means iterations when (re)training partitions.
    pub ivf_train_iterations: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: "lore.db".to_string(),
            pool_size: 8,
            acquire_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            ivf_min_vectors: 1_024,
            ivf_lists: 0,
            ivf_probes: 8,
            ivf_train_iterations: 10,
        }
    }
}

impl StorageConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Tag generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TagConfig {
    /// Maximum tags kept per generation.
    pub max_tags: usize,
    /// Confidence assigned when the provider reports none.
    pub default_confidence: f64,
}

impl Default for TagConfig {
    fn default() -> Self {
        Self {
            max_tags: 10,
            default_confidence: 0.5,
        }
    }
}

/// Relationship analysis settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelationshipConfig {
    /// Maximum characters in one analysis request.
    pub max_characters: usize,
    /// Facts per character included in the reasoning prompt.
    pub max_facts_per_character: usize,
    /// Maximum hops for indirect relationship discovery.
    pub max_depth: usize,
    /// Maximum indirect paths reported.
    pub max_paths: usize,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            max_characters: 20,
            max_facts_per_character: 20,
            max_depth: 3,
            max_paths: 100,
        }
    }
}

/// HTTP tool surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Request body limit in bytes.
    pub max_body_bytes: usize,
    /// Sustained tool calls per minute.
    pub rate_limit_per_minute: u32,
    /// Burst capacity above the sustained rate.
    pub rate_limit_burst: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            rate_limit_per_minute: 600,
            rate_limit_burst: 60,
        }
    }
}
