//! Cache-fronted embedding: the path every vector in the system takes.

use std::sync::Arc;

use lore_core::deadline::Deadline;
use lore_core::error::Result;

use crate::cache::{CacheStats, EmbeddingCache};
use crate::client::{ProviderClient, TruncationNotice};

/// A vector for some text, shared with the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedText {
    pub vector: Arc<Vec<f32>>,
    pub truncated: Option<TruncationNotice>,
}

/// [`ProviderClient`] behind an [`EmbeddingCache`].
///
/// Text is normalized and truncated before fingerprinting, so the cache key
/// always matches what the provider actually saw.
#[derive(Clone)]
pub struct Embedder {
    client: Arc<ProviderClient>,
    cache: Arc<EmbeddingCache>,
}

impl Embedder {
    pub fn new(client: Arc<ProviderClient>, cache: Arc<EmbeddingCache>) -> Self {
        Self { client, cache }
    }

    pub fn client(&self) -> &Arc<ProviderClient> {
        &self.client
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn dimension(&self) -> usize {
        self.client.dimension()
    }

    pub async fn embed(&self, text: &str, deadline: Deadline) -> Result<EmbeddedText> {
        let prepared = self.client.prepare(text)?;
        let client = Arc::clone(&self.client);
        let input = prepared.text.clone();
        let vector = self
            .cache
            .get_or_compute(self.client.model(), &prepared.text, || async move {
                client.embed_prepared(&input, deadline).await
            })
            .await?;
        Ok(EmbeddedText {
            vector,
            truncated: prepared.truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_core::config::ProviderConfig;

    use crate::provider::MockProvider;

    #[tokio::test]
    async fn test_whitespace_variants_share_one_provider_call() {
        let mock = Arc::new(MockProvider::new(8));
        let client = Arc::new(ProviderClient::new(mock.clone(), &ProviderConfig::default(), 8));
        let embedder = Embedder::new(client, Arc::new(EmbeddingCache::new(100, None)));

        let a = embedder.embed("calm  and\tsteady", Deadline::none()).await.unwrap();
        let b = embedder.embed(" calm and steady ", Deadline::none()).await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert_eq!(mock.embed_calls(), 1);
        assert_eq!(embedder.cache_stats().hits, 1);
    }
}
