//! Lore Vector crate - model providers, embedding cache, hybrid search and ingestion.
//!
//! Provides the [`ModelProvider`] abstraction with an OpenAI-compatible HTTP
//! backend and a deterministic mock, a retrying circuit-broken
//! [`ProviderClient`], a singleflight [`EmbeddingCache`], the
//! [`HybridSearchEngine`] and the [`IngestPipeline`].

pub mod breaker;
pub mod cache;
pub mod client;
pub mod embedder;
pub mod pipeline;
pub mod provider;
pub mod retry;
pub mod search;

pub use breaker::{BreakerPermit, BreakerState, CircuitBreaker};
pub use cache::{CacheStats, EmbeddingCache};
pub use client::{Embedding, PreparedText, ProviderClient, TruncationNotice};
pub use embedder::{EmbeddedText, Embedder};
pub use pipeline::{EmbeddingReport, IngestPipeline, Ingested};
pub use provider::{
    from_config, CompletionRequest, MockProvider, ModelProvider, OpenAiProvider, ScriptedFailure,
};
pub use retry::RetryPolicy;
pub use search::{
    HybridSearchEngine, SearchHit, SearchRequest, SearchResponse, VectorSearch, MAX_QUERY_CHARS,
};
