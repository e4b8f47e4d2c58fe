//! Hybrid search over facts and characters.
//!
//! A query is embedded through the cache, then candidates are pulled from
//! three sources: vector similarity, trigram lexical matching and tag
//! matching. The union passes the hard filters and the similarity floor and
//! is ranked by a weighted sum of the three signals.
//!
//! When the provider cannot embed the query, the search degrades to lexical
//! and tag candidates only and says so in the response.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use lore_core::config::SearchConfig;
use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result};
use lore_core::text::{label_key, normalize};
use lore_core::types::{Character, Fact, SearchFilters, TagMatchMode};
use lore_storage::{cosine_similarity, KnowledgeStore, LexicalMatch, VectorMatch};

use crate::embedder::Embedder;

/// Longest accepted query, in characters after normalization.
pub const MAX_QUERY_CHARS: usize = 1_000;

/// A search request. Unset fields take the configured defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub filters: SearchFilters,
    pub tag_mode: TagMatchMode,
    pub similarity_threshold: Option<f64>,
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }

    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_tag_mode(mut self, mode: TagMatchMode) -> Self {
        self.tag_mode = mode;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = Some(threshold);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Whether the vector term took part in ranking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSearch {
    Used,
    Skipped,
}

/// One ranked result with the signals that produced its score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit<T> {
    pub entity: T,
    pub score: f64,
    /// Cosine similarity to the query. `None` when vector search was skipped.
    pub similarity: Option<f64>,
    pub lexical_score: f64,
    pub tag_score: f64,
}

/// Ranked hits plus how they were obtained.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse<T> {
    pub hits: Vec<SearchHit<T>>,
    pub vector_search: VectorSearch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub warnings: Vec<String>,
}

impl<T> SearchResponse<T> {
    /// A response with no hits, e.g. when the filters cannot match anything.
    pub fn empty(warning: impl Into<String>) -> Self {
        Self {
            hits: Vec::new(),
            vector_search: VectorSearch::Skipped,
            degraded_reason: None,
            warnings: vec![warning.into()],
        }
    }
}

/// Accessors the ranker needs from an entity.
trait Ranked {
    fn id(&self) -> Uuid;
    fn updated_at(&self) -> DateTime<Utc>;
    fn tags(&self) -> &[String];
}

impl Ranked for Fact {
    fn id(&self) -> Uuid {
        self.id
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn tags(&self) -> &[String] {
        &self.tags
    }
}

impl Ranked for Character {
    fn id(&self) -> Uuid {
        self.id
    }
    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
    fn tags(&self) -> &[String] {
        &self.tags
    }
}

struct Candidate<T> {
    entity: T,
    similarity: Option<f64>,
    lexical: f64,
}

impl<T> Candidate<T> {
    fn new(entity: T) -> Self {
        Self {
            entity,
            similarity: None,
            lexical: 0.0,
        }
    }
}

/// Outcome of embedding the query.
struct QueryVector {
    vector: Option<Arc<Vec<f32>>>,
    degraded_reason: Option<String>,
    warnings: Vec<String>,
}

/// Validated request parameters.
struct Plan {
    query: String,
    threshold: f64,
    limit: usize,
    pool: usize,
}

pub struct HybridSearchEngine {
    store: KnowledgeStore,
    embedder: Embedder,
    config: SearchConfig,
}

impl HybridSearchEngine {
    pub fn new(store: KnowledgeStore, embedder: Embedder, config: SearchConfig) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Rank facts against `request.query`.
    pub async fn search_facts(
        &self,
        request: &SearchRequest,
        deadline: Deadline,
    ) -> Result<SearchResponse<Fact>> {
        let plan = self.plan(request)?;
        let query = self.embed_query(&plan.query, deadline).await?;
        let filters = &request.filters;

        let mut candidates: HashMap<Uuid, Candidate<Fact>> = HashMap::new();
        if let Some(vector) = &query.vector {
            let matches = self.store.find_facts_by_vector(vector, plan.pool, filters).await?;
            merge_vector(&mut candidates, matches);
        }
        let lexical = self
            .store
            .find_facts_by_lexical(&plan.query, filters, self.config.min_lexical_score, plan.pool)
            .await?;
        merge_lexical(&mut candidates, lexical);
        if !filters.tags.is_empty() {
            let tagged = self
                .store
                .find_facts_by_tags(&filters.tags, request.tag_mode, filters)
                .await?;
            merge_tagged(&mut candidates, tagged);
        }

        candidates.retain(|_, c| filters.admits_fact(&c.entity));
        if let Some(vector) = &query.vector {
            for candidate in candidates.values_mut().filter(|c| c.similarity.is_none()) {
                candidate.similarity = self
                    .store
                    .fact_vector(candidate.entity.id)
                    .map(|v| cosine_similarity(vector, &v));
            }
        }

        let response = self.rank(candidates, &plan, query, &filters.tags);
        info!(
            scope = "facts",
            hits = response.hits.len(),
            vector_search = ?response.vector_search,
            "Search completed"
        );
        Ok(response)
    }

    /// Rank characters against `request.query` using their profile vectors.
    ///
    /// `filters.fact_types` admits characters owning a fact of those types.
    pub async fn search_characters(
        &self,
        request: &SearchRequest,
        deadline: Deadline,
    ) -> Result<SearchResponse<Character>> {
        let plan = self.plan(request)?;
        let query = self.embed_query(&plan.query, deadline).await?;
        let filters = &request.filters;

        let mut candidates: HashMap<Uuid, Candidate<Character>> = HashMap::new();
        if let Some(vector) = &query.vector {
            let matches = self
                .store
                .find_characters_by_vector(vector, plan.pool, filters)
                .await?;
            merge_vector(&mut candidates, matches);
        }
        let lexical = self
            .store
            .find_characters_by_lexical(&plan.query, filters, self.config.min_lexical_score, plan.pool)
            .await?;
        merge_lexical(&mut candidates, lexical);
        if !filters.tags.is_empty() {
            let tagged = self
                .store
                .find_characters_by_tags(&filters.tags, request.tag_mode, filters)
                .await?;
            merge_tagged(&mut candidates, tagged);
        }

        if !filters.fact_types.is_empty() {
            let with_types = self.store.characters_with_fact_types(&filters.fact_types).await?;
            candidates.retain(|id, _| with_types.contains(id));
        }
        candidates.retain(|id, _| filters.admits_character(*id));
        if let Some(vector) = &query.vector {
            for candidate in candidates.values_mut().filter(|c| c.similarity.is_none()) {
                candidate.similarity = self
                    .store
                    .character_vector(candidate.entity.id)
                    .map(|v| cosine_similarity(vector, &v));
            }
        }

        let response = self.rank(candidates, &plan, query, &filters.tags);
        info!(
            scope = "characters",
            hits = response.hits.len(),
            vector_search = ?response.vector_search,
            "Search completed"
        );
        Ok(response)
    }

    fn plan(&self, request: &SearchRequest) -> Result<Plan> {
        let query = normalize(&request.query);
        if query.is_empty() {
            return Err(LoreError::validation("query must not be empty"));
        }
        let chars = query.chars().count();
        if chars > MAX_QUERY_CHARS {
            return Err(LoreError::validation(format!(
                "query must be at most {} characters, got {}",
                MAX_QUERY_CHARS, chars
            )));
        }

        let limit = request.limit.unwrap_or(self.config.default_limit);
        if limit == 0 || limit > self.config.max_limit {
            return Err(LoreError::validation(format!(
                "limit must be between 1 and {}, got {}",
                self.config.max_limit, limit
            )));
        }

        let threshold = request
            .similarity_threshold
            .unwrap_or(self.config.default_similarity_threshold);
        if threshold.is_nan() || !(0.0..=1.0).contains(&threshold) {
            return Err(LoreError::validation(format!(
                "similarity_threshold must be within [0, 1], got {}",
                threshold
            )));
        }

        Ok(Plan {
            query,
            threshold,
            limit,
            pool: limit.saturating_mul(self.config.candidate_multiplier),
        })
    }

    async fn embed_query(&self, query: &str, deadline: Deadline) -> Result<QueryVector> {
        match self.embedder.embed(query, deadline).await {
            Ok(embedded) => Ok(QueryVector {
                vector: Some(embedded.vector),
                degraded_reason: None,
                warnings: embedded.truncated.iter().map(|n| n.message()).collect(),
            }),
            Err(e) if e.is_provider() => {
                warn!(error = %e, "Query embedding failed, searching without vectors");
                Ok(QueryVector {
                    vector: None,
                    degraded_reason: Some(format!("{}: {}", e.code(), e)),
                    warnings: vec![
                        "vector search skipped; results come from lexical and tag matches only"
                            .to_string(),
                    ],
                })
            }
            Err(e) => Err(e),
        }
    }

    fn rank<T: Ranked>(
        &self,
        candidates: HashMap<Uuid, Candidate<T>>,
        plan: &Plan,
        query: QueryVector,
        filter_tags: &[String],
    ) -> SearchResponse<T> {
        let vector_used = query.vector.is_some();
        let wanted: HashSet<String> = filter_tags.iter().map(|t| label_key(t)).collect();
        let (w_v, w_l, w_t) = (
            self.config.vector_weight,
            self.config.lexical_weight,
            self.config.tag_weight,
        );
        let fallback_norm = w_l + w_t;

        let total = candidates.len();
        let mut hits: Vec<SearchHit<T>> = candidates
            .into_values()
            .filter_map(|c| {
                let tag_score = tag_overlap(c.entity.tags(), &wanted);
                let score = if vector_used {
                    // Threshold is a hard floor; a candidate without a vector
                    // cannot prove it clears it.
                    let similarity = c.similarity?;
                    if similarity < plan.threshold {
                        return None;
                    }
                    w_v * similarity + w_l * c.lexical + w_t * tag_score
                } else if fallback_norm > 0.0 {
                    (w_l * c.lexical + w_t * tag_score) / fallback_norm
                } else {
                    0.0
                };
                Some(SearchHit {
                    entity: c.entity,
                    score,
                    similarity: c.similarity,
                    lexical_score: c.lexical,
                    tag_score,
                })
            })
            .collect();

        hits.sort_by(compare_hits);
        hits.truncate(plan.limit);
        debug!(
            candidates = total,
            returned = hits.len(),
            threshold = plan.threshold,
            "Candidates ranked"
        );

        SearchResponse {
            hits,
            vector_search: if vector_used {
                VectorSearch::Used
            } else {
                VectorSearch::Skipped
            },
            degraded_reason: query.degraded_reason,
            warnings: query.warnings,
        }
    }
}

/// Higher score first, then most recently updated, then lowest id.
fn compare_hits<T: Ranked>(a: &SearchHit<T>, b: &SearchHit<T>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.entity.updated_at().cmp(&a.entity.updated_at()))
        .then_with(|| a.entity.id().cmp(&b.entity.id()))
}

/// Share of the requested tags the entity carries.
fn tag_overlap(tags: &[String], wanted: &HashSet<String>) -> f64 {
    if wanted.is_empty() {
        return 0.0;
    }
    let have: HashSet<String> = tags.iter().map(|t| label_key(t)).collect();
    wanted.intersection(&have).count() as f64 / wanted.len() as f64
}

fn merge_vector<T: Ranked>(into: &mut HashMap<Uuid, Candidate<T>>, matches: Vec<VectorMatch<T>>) {
    for VectorMatch { entity, similarity } in matches {
        into.entry(entity.id())
            .or_insert_with(|| Candidate::new(entity))
            .similarity = Some(similarity);
    }
}

fn merge_lexical<T: Ranked>(into: &mut HashMap<Uuid, Candidate<T>>, matches: Vec<LexicalMatch<T>>) {
    for LexicalMatch { entity, score } in matches {
        into.entry(entity.id())
            .or_insert_with(|| Candidate::new(entity))
            .lexical = score;
    }
}

fn merge_tagged<T: Ranked>(into: &mut HashMap<Uuid, Candidate<T>>, entities: Vec<T>) {
    for entity in entities {
        into.entry(entity.id()).or_insert_with(|| Candidate::new(entity));
    }
}
