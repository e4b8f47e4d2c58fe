//! Lore ingestion pipeline.
//!
//! Entities enter the knowledge base here: their text is embedded through the
//! cache and the entity is persisted together with its vector. A provider
//! outage does not lose the write; the entity is stored without a vector,
//! reported as pending, and picked up later by [`IngestPipeline::backfill`].

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result};
use lore_core::types::{Character, EmbeddingStatus, EntityKind, Fact, Relation};
use lore_storage::{BacklogScope, KnowledgeStore};

use crate::embedder::Embedder;

/// Backlog rows fetched per store round trip.
const BATCH_SIZE: usize = 64;

/// A persisted entity and how its vector fared.
#[derive(Debug, Clone, Serialize)]
pub struct Ingested<T> {
    pub entity: T,
    pub embedding_status: EmbeddingStatus,
    pub warnings: Vec<String>,
}

/// Outcome of a backfill or re-embedding pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingReport {
    pub embedded: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Why the pass ended early, if it did.
    pub stopped: Option<String>,
}

impl EmbeddingReport {
    fn attempted(&self) -> usize {
        self.embedded + self.failed + self.skipped
    }
}

struct Vectorized {
    vector: Option<Vec<f32>>,
    status: EmbeddingStatus,
    warnings: Vec<String>,
}

/// Embeds and persists characters, facts and relations.
pub struct IngestPipeline {
    store: KnowledgeStore,
    embedder: Embedder,
}

impl IngestPipeline {
    /// Fails if the store and the provider disagree on the vector dimension.
    pub fn new(store: KnowledgeStore, embedder: Embedder) -> Result<Self> {
        if store.dimension() != embedder.dimension() {
            return Err(LoreError::DimensionMismatch {
                entity: "provider client".to_string(),
                expected: store.dimension(),
                actual: embedder.dimension(),
            });
        }
        Ok(Self { store, embedder })
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    /// Persist a new character with its profile vector.
    pub async fn create_character(
        &self,
        mut character: Character,
        deadline: Deadline,
    ) -> Result<Ingested<Character>> {
        character.validate()?;
        let outcome = self.vectorize(&character.profile_text(), deadline).await?;
        character.embedding = outcome.vector;
        self.store.create_character(&character).await?;
        Ok(Ingested {
            entity: character,
            embedding_status: outcome.status,
            warnings: outcome.warnings,
        })
    }

    /// Persist a new fact with its content vector.
    ///
    /// The owner is checked before the provider is called.
    pub async fn add_fact(&self, mut fact: Fact, deadline: Deadline) -> Result<Ingested<Fact>> {
        fact.validate()?;
        if self.store.find_character(fact.character_id).await?.is_none() {
            return Err(LoreError::not_found("character", fact.character_id));
        }
        let outcome = self.vectorize(&fact.content, deadline).await?;
        fact.embedding = outcome.vector;
        self.store.add_fact(&fact).await?;
        debug!(fact_id = %fact.id, status = ?outcome.status, "Fact ingested");
        Ok(Ingested {
            entity: fact,
            embedding_status: outcome.status,
            warnings: outcome.warnings,
        })
    }

    /// Persist a new relation. Only a non-empty description is embedded.
    pub async fn create_relation(
        &self,
        mut relation: Relation,
        deadline: Deadline,
    ) -> Result<Ingested<Relation>> {
        relation.validate()?;
        for endpoint in [relation.source_id, relation.target_id] {
            if self.store.find_character(endpoint).await?.is_none() {
                return Err(LoreError::not_found("character", endpoint));
            }
        }
        let outcome = if relation.description.trim().is_empty() {
            Vectorized {
                vector: None,
                status: EmbeddingStatus::NotApplicable,
                warnings: Vec::new(),
            }
        } else {
            self.vectorize(&relation.description, deadline).await?
        };
        relation.embedding = outcome.vector;
        self.store.create_relation(&relation).await?;
        Ok(Ingested {
            entity: relation,
            embedding_status: outcome.status,
            warnings: outcome.warnings,
        })
    }

    /// Embed up to `limit` entities still waiting for a vector.
    pub async fn backfill(&self, limit: usize, deadline: Deadline) -> Result<EmbeddingReport> {
        let report = self.drain(BacklogScope::Pending, Some(limit), deadline).await?;
        info!(
            embedded = report.embedded,
            failed = report.failed,
            skipped = report.skipped,
            "Embedding backfill finished"
        );
        Ok(report)
    }

    /// Recompute every vector, e.g. after the model or dimension changed.
    pub async fn reembed_all(&self, deadline: Deadline) -> Result<EmbeddingReport> {
        let report = self.drain(BacklogScope::All, None, deadline).await?;
        info!(
            embedded = report.embedded,
            failed = report.failed,
            skipped = report.skipped,
            "Re-embedding finished"
        );
        Ok(report)
    }

    async fn vectorize(&self, text: &str, deadline: Deadline) -> Result<Vectorized> {
        match self.embedder.embed(text, deadline).await {
            Ok(embedded) => Ok(Vectorized {
                vector: Some(embedded.vector.as_ref().clone()),
                status: EmbeddingStatus::Ready,
                warnings: embedded.truncated.iter().map(|n| n.message()).collect(),
            }),
            Err(e) if e.is_provider() => {
                warn!(error = %e, "Embedding unavailable, storing entity as pending");
                Ok(Vectorized {
                    vector: None,
                    status: EmbeddingStatus::Pending,
                    warnings: vec![format!("embedding deferred ({}): {}", e.code(), e)],
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn drain(
        &self,
        scope: BacklogScope,
        limit: Option<usize>,
        deadline: Deadline,
    ) -> Result<EmbeddingReport> {
        let mut report = EmbeddingReport::default();

        'kinds: for kind in [EntityKind::Character, EntityKind::Fact, EntityKind::Relation] {
            let mut offset = 0;
            loop {
                let budget = match limit {
                    Some(limit) => limit.saturating_sub(report.attempted()).min(BATCH_SIZE),
                    None => BATCH_SIZE,
                };
                if budget == 0 {
                    break 'kinds;
                }
                let jobs = self.store.embedding_backlog(kind, scope, offset, budget).await?;
                let fetched = jobs.len();
                // Rows that stay in the backlog after this batch.
                let mut stuck = 0;

                for job in jobs {
                    match self.embedder.embed(&job.text, deadline).await {
                        Ok(embedded) => match self.store.set_embedding(kind, job.id, &embedded.vector).await {
                            Ok(()) => report.embedded += 1,
                            Err(LoreError::NotFound { .. }) => report.skipped += 1,
                            Err(e) => return Err(e),
                        },
                        Err(e @ LoreError::ProviderUnavailable { .. }) => {
                            report.failed += 1;
                            report.stopped = Some(e.to_string());
                            warn!(kind = kind.as_str(), error = %e, "Provider unavailable, stopping embedding pass");
                            break 'kinds;
                        }
                        Err(e) if e.is_provider() => {
                            report.failed += 1;
                            stuck += 1;
                            warn!(kind = kind.as_str(), id = %job.id, error = %e, "Embedding failed");
                            if deadline.is_expired() {
                                report.stopped = Some("deadline expired".to_string());
                                break 'kinds;
                            }
                        }
                        Err(LoreError::Validation(msg)) => {
                            report.skipped += 1;
                            stuck += 1;
                            debug!(kind = kind.as_str(), id = %job.id, reason = %msg, "Nothing to embed");
                        }
                        Err(e) => return Err(e),
                    }
                }

                offset += match scope {
                    BacklogScope::Pending => stuck,
                    BacklogScope::All => fetched,
                };
                if fetched < budget {
                    break;
                }
            }
        }
        Ok(report)
    }

    /// Embedding status of a stored entity.
    pub async fn embedding_status(&self, kind: EntityKind, id: Uuid) -> Result<EmbeddingStatus> {
        let indexed = match kind {
            EntityKind::Character => {
                self.store.get_character(id).await?;
                self.store.character_vector(id).is_some()
            }
            EntityKind::Fact => {
                self.store.get_fact(id).await?;
                self.store.fact_vector(id).is_some()
            }
            EntityKind::Relation => {
                let relation = self.store.get_relation(id).await?;
                if relation.description.is_empty() {
                    return Ok(EmbeddingStatus::NotApplicable);
                }
                relation.embedding.is_some()
            }
        };
        Ok(if indexed {
            EmbeddingStatus::Ready
        } else {
            EmbeddingStatus::Pending
        })
    }
}
