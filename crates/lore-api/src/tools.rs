//! The tool-call surface.
//!
//! [`ToolService`] owns every component and dispatches a named tool with JSON
//! arguments to them. The HTTP layer and the CLI are thin wrappers over it.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use lore_core::config::LoreConfig;
use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result};
use lore_core::text::{dedup_labels, extract_keywords, jaccard_similarity};
use lore_core::types::{
    Character, EmbeddingStatus, EntityKind, Fact, Relation, SearchFilters,
};
use lore_insight::{
    CharacterProfiler, CharacterSummary, DevelopmentSuggestions, RelationshipAnalysis,
    RelationshipAnalyzer, TagGenerator,
};
use lore_storage::KnowledgeStore;
use lore_vector::{
    BreakerState, CacheStats, Embedder, EmbeddingCache, HybridSearchEngine, IngestPipeline,
    ModelProvider, ProviderClient, SearchHit, SearchRequest, SearchResponse, VectorSearch,
};

use crate::schema::{
    decode, AddFactArgs, AnalyzeRelationshipsArgs, CharacterIdArgs, CharacterIdsArgs,
    CreateCharacterArgs, CreateRelationshipArgs, GenerateTagsArgs, SearchCharactersArgs,
    SearchFactsArgs, SuggestDevelopmentArgs, MAX_TAGS,
};

/// Facts fed to tag generation for a stored character.
const TAG_CONTEXT_FACTS: usize = 20;

/// Existing facts compared against a new one for near-duplicates.
const DUPLICATE_SCAN_FACTS: usize = 200;

/// Token overlap at which a new fact is reported as a near-duplicate.
const DUPLICATE_JACCARD: f64 = 0.9;

const KEYWORD_COUNT: usize = 10;

/// Name, description and input schema of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

// =============================================================================
// Tool outputs
// =============================================================================

#[derive(Debug, Serialize)]
pub struct CharacterCreated {
    #[serde(flatten)]
    pub character: Character,
    /// Confidence of each generated tag; user-supplied tags are absent.
    pub tag_confidence: BTreeMap<String, f64>,
    pub embedding_status: EmbeddingStatus,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FactAdded {
    #[serde(flatten)]
    pub fact: Fact,
    pub embedding_status: EmbeddingStatus,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RelationCreated {
    #[serde(flatten)]
    pub relation: Relation,
    pub embedding_status: EmbeddingStatus,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ScoredCharacter {
    #[serde(flatten)]
    pub character: Character,
    pub score: f64,
    pub similarity: Option<f64>,
    pub lexical_score: f64,
    pub tag_score: f64,
}

#[derive(Debug, Serialize)]
pub struct ScoredFact {
    #[serde(flatten)]
    pub fact: Fact,
    pub character_name: Option<String>,
    pub score: f64,
    pub similarity: Option<f64>,
    pub lexical_score: f64,
    pub tag_score: f64,
}

#[derive(Debug, Serialize)]
pub struct SearchOutput<T> {
    pub results: Vec<T>,
    pub vector_search: VectorSearch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded_reason: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct TagsOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub character_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub confidence_scores: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
pub struct CharacterDetail {
    pub character: Character,
    pub facts: Vec<Fact>,
    pub relations: Vec<NamedRelation>,
    pub keywords: Vec<String>,
    pub embedding_status: EmbeddingStatus,
}

#[derive(Debug, Serialize)]
pub struct NamedRelation {
    #[serde(flatten)]
    pub relation: Relation,
    pub source_name: Option<String>,
    pub target_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CharacterDeleted {
    pub character_id: Uuid,
    pub deleted: bool,
    pub facts_removed: usize,
    pub relations_removed: usize,
}

#[derive(Debug, Serialize)]
pub struct RelationshipsOutput {
    pub relationships: Vec<NamedRelation>,
}

// =============================================================================
// Service
// =============================================================================

/// Dispatches tool calls to the knowledge base components.
pub struct ToolService {
    config: Arc<LoreConfig>,
    store: KnowledgeStore,
    client: Arc<ProviderClient>,
    embedder: Embedder,
    pipeline: IngestPipeline,
    search: HybridSearchEngine,
    tags: TagGenerator,
    relationships: RelationshipAnalyzer,
    profiler: CharacterProfiler,
}

impl ToolService {
    /// Wire every component from one configuration and provider.
    ///
    /// Fails with `DimensionMismatch` if the store was opened with a
    /// different dimension than `embedding.dimension`.
    pub fn new(
        config: Arc<LoreConfig>,
        store: KnowledgeStore,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self> {
        let client = Arc::new(ProviderClient::new(
            provider,
            &config.provider,
            config.embedding.dimension,
        ));
        let cache = Arc::new(EmbeddingCache::from_config(&config.embedding));
        let embedder = Embedder::new(client.clone(), cache);
        let pipeline = IngestPipeline::new(store.clone(), embedder.clone())?;
        let search = HybridSearchEngine::new(store.clone(), embedder.clone(), config.search.clone());
        let tags = TagGenerator::new(client.clone(), config.tags.clone());
        let relationships =
            RelationshipAnalyzer::new(store.clone(), client.clone(), config.relationships.clone());
        let profiler =
            CharacterProfiler::new(store.clone(), client.clone(), config.relationships.clone());

        Ok(Self {
            config,
            store,
            client,
            embedder,
            pipeline,
            search,
            tags,
            relationships,
            profiler,
        })
    }

    pub fn config(&self) -> &LoreConfig {
        &self.config
    }

    pub fn store(&self) -> &KnowledgeStore {
        &self.store
    }

    pub fn pipeline(&self) -> &IngestPipeline {
        &self.pipeline
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.client.breaker_state()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.embedder.cache_stats()
    }

    /// Run the tool `name` with JSON `args` under the per-call deadline.
    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        let started = Instant::now();
        let deadline = Deadline::after(self.config.search.call_timeout());
        let result = self.dispatch(name, args, deadline).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(tool = name, elapsed_ms, "Tool call completed"),
            Err(e) => warn!(tool = name, elapsed_ms, code = e.code(), error = %e, "Tool call failed"),
        }
        result
    }

    async fn dispatch(&self, name: &str, args: Value, deadline: Deadline) -> Result<Value> {
        match name {
            "create_character" => to_json(self.create_character(decode(name, args)?, deadline).await?),
            "search_characters" => {
                to_json(self.search_characters(decode(name, args)?, deadline).await?)
            }
            "add_character_fact" => to_json(self.add_fact(decode(name, args)?, deadline).await?),
            "search_facts" => to_json(self.search_facts(decode(name, args)?, deadline).await?),
            "generate_character_tags" => {
                to_json(self.generate_tags(decode(name, args)?, deadline).await?)
            }
            "analyze_character_relationships" => {
                to_json(self.analyze_relationships(decode(name, args)?, deadline).await?)
            }
            "get_character" => to_json(self.get_character(decode(name, args)?).await?),
            "delete_character" => to_json(self.delete_character(decode(name, args)?).await?),
            "create_relationship" => {
                to_json(self.create_relationship(decode(name, args)?, deadline).await?)
            }
            "get_character_relationships" => {
                to_json(self.get_relationships(decode(name, args)?).await?)
            }
            "summarize_character" => to_json(self.summarize(decode(name, args)?, deadline).await?),
            "suggest_character_development" => {
                to_json(self.suggest_development(decode(name, args)?, deadline).await?)
            }
            _ => Err(LoreError::not_found("tool", name)),
        }
    }

    // =========================================================================
    // Characters
    // =========================================================================

    pub async fn create_character(
        &self,
        args: CreateCharacterArgs,
        deadline: Deadline,
    ) -> Result<CharacterCreated> {
        args.validate()?;
        let mut warnings = Vec::new();
        let mut tag_confidence = BTreeMap::new();
        let mut tags = args.tags.clone();

        if !args.description.trim().is_empty() {
            match self.tags.generate(&args.description, deadline).await {
                Ok(generated) => {
                    for tag in generated {
                        tag_confidence.insert(tag.tag.clone(), tag.confidence);
                        tags.push(tag.tag);
                    }
                }
                Err(e) if e.is_provider() => {
                    warn!(error = %e, "Tag generation failed, creating character without generated tags");
                    warnings.push(format!("tags were not generated: {}", e));
                }
                Err(e) => return Err(e),
            }
        }
        let mut tags = dedup_labels(tags);
        tags.truncate(MAX_TAGS);
        tag_confidence.retain(|tag, _| tags.contains(tag));

        let character = Character::new(&args.name, args.aliases, &args.description, tags)?;
        let ingested = self.pipeline.create_character(character, deadline).await?;
        warnings.extend(ingested.warnings);
        info!(character_id = %ingested.entity.id, name = %ingested.entity.name, "Character created");
        Ok(CharacterCreated {
            character: ingested.entity,
            tag_confidence,
            embedding_status: ingested.embedding_status,
            warnings,
        })
    }

    pub async fn search_characters(
        &self,
        args: SearchCharactersArgs,
        deadline: Deadline,
    ) -> Result<SearchOutput<ScoredCharacter>> {
        args.validate()?;
        let request = SearchRequest {
            query: args.query,
            filters: SearchFilters {
                tags: args.filters.tags,
                fact_types: args.filters.fact_types,
                character_ids: Vec::new(),
            },
            tag_mode: args.tag_mode,
            similarity_threshold: args.similarity_threshold,
            limit: args.limit,
        };
        let response = self.search.search_characters(&request, deadline).await?;
        Ok(into_output(response, Vec::new(), |hit| ScoredCharacter {
            character: hit.entity,
            score: hit.score,
            similarity: hit.similarity,
            lexical_score: hit.lexical_score,
            tag_score: hit.tag_score,
        }))
    }

    pub async fn get_character(&self, args: CharacterIdArgs) -> Result<CharacterDetail> {
        let character = self.store.get_character(args.character_id).await?;
        let facts = self.store.facts_for(character.id, None).await?;
        let relations = self.store.relations_for(character.id).await?;
        let relations = self.name_relations(relations).await?;
        let embedding_status = self
            .pipeline
            .embedding_status(EntityKind::Character, character.id)
            .await?;

        let mut corpus = character.description.clone();
        for fact in &facts {
            corpus.push('\n');
            corpus.push_str(&fact.content);
        }
        Ok(CharacterDetail {
            keywords: extract_keywords(&corpus, KEYWORD_COUNT),
            character,
            facts,
            relations,
            embedding_status,
        })
    }

    pub async fn delete_character(&self, args: CharacterIdArgs) -> Result<CharacterDeleted> {
        let summary = self.store.delete_character(args.character_id).await?;
        Ok(CharacterDeleted {
            character_id: args.character_id,
            deleted: true,
            facts_removed: summary.facts_removed,
            relations_removed: summary.relations_removed,
        })
    }

    // =========================================================================
    // Facts
    // =========================================================================

    pub async fn add_fact(&self, args: AddFactArgs, deadline: Deadline) -> Result<FactAdded> {
        args.validate()?;
        let fact = Fact::new(
            args.character_id,
            &args.fact_type,
            &args.content,
            args.source,
            args.tags,
        )?;

        let existing = match self.store.find_character(fact.character_id).await? {
            Some(_) => self
                .store
                .facts_for(fact.character_id, Some(DUPLICATE_SCAN_FACTS))
                .await?,
            None => return Err(LoreError::not_found("character", fact.character_id)),
        };
        let near_duplicate = existing
            .iter()
            .find(|f| jaccard_similarity(&f.content, &fact.content) >= DUPLICATE_JACCARD)
            .map(|f| f.id);

        let ingested = self.pipeline.add_fact(fact, deadline).await?;
        let mut warnings = ingested.warnings;
        if let Some(id) = near_duplicate {
            warnings.push(format!("content closely matches existing fact {}", id));
        }
        info!(
            fact_id = %ingested.entity.id,
            character_id = %ingested.entity.character_id,
            status = ?ingested.embedding_status,
            "Fact added"
        );
        Ok(FactAdded {
            fact: ingested.entity,
            embedding_status: ingested.embedding_status,
            warnings,
        })
    }

    /// Search facts, optionally scoped to characters given by name or id.
    ///
    /// Names and ids together form one set of owners. Names that match no
    /// character produce a warning; if nothing resolves the result is empty.
    pub async fn search_facts(
        &self,
        args: SearchFactsArgs,
        deadline: Deadline,
    ) -> Result<SearchOutput<ScoredFact>> {
        args.validate()?;
        let mut warnings = Vec::new();
        let mut owners = args.character_ids.clone();
        if !args.character_names.is_empty() {
            let mut unknown = Vec::new();
            for name in &args.character_names {
                let found = self.store.find_characters_by_name(name).await?;
                if found.is_empty() {
                    unknown.push(name.trim().to_string());
                }
                owners.extend(found.into_iter().map(|c| c.id));
            }
            if !unknown.is_empty() {
                warnings.push(format!("unknown character name(s): {}", unknown.join(", ")));
            }
            if owners.is_empty() {
                let response = SearchResponse::empty("no characters matched the requested names");
                return Ok(into_output(response, warnings, |hit| scored_fact(hit, None)));
            }
        }
        let mut seen = HashSet::new();
        owners.retain(|id| seen.insert(*id));

        let request = SearchRequest {
            query: args.query,
            filters: SearchFilters {
                tags: args.tags,
                fact_types: args.fact_types,
                character_ids: owners,
            },
            tag_mode: args.tag_mode,
            similarity_threshold: args.similarity_threshold,
            limit: args.limit,
        };
        let response = self.search.search_facts(&request, deadline).await?;

        let mut names: BTreeMap<Uuid, Option<String>> = BTreeMap::new();
        for hit in &response.hits {
            if !names.contains_key(&hit.entity.character_id) {
                let name = self
                    .store
                    .find_character(hit.entity.character_id)
                    .await?
                    .map(|c| c.name);
                names.insert(hit.entity.character_id, name);
            }
        }
        Ok(into_output(response, warnings, |hit| {
            let name = names.get(&hit.entity.character_id).cloned().flatten();
            scored_fact(hit, name)
        }))
    }

    // =========================================================================
    // Relations
    // =========================================================================

    pub async fn create_relationship(
        &self,
        args: CreateRelationshipArgs,
        deadline: Deadline,
    ) -> Result<RelationCreated> {
        args.validate()?;
        let relation = Relation::new(
            args.source_id,
            args.target_id,
            &args.relation_type,
            &args.description,
            args.strength,
        )?;
        let ingested = self.pipeline.create_relation(relation, deadline).await?;
        info!(
            relation_id = %ingested.entity.id,
            relation_type = %ingested.entity.relation_type,
            "Relationship created"
        );
        Ok(RelationCreated {
            relation: ingested.entity,
            embedding_status: ingested.embedding_status,
            warnings: ingested.warnings,
        })
    }

    /// Every stored relation touching any of the characters, once each.
    pub async fn get_relationships(&self, args: CharacterIdsArgs) -> Result<RelationshipsOutput> {
        args.validate()?;
        let mut seen = HashSet::new();
        let mut relations = Vec::new();
        for id in &args.character_ids {
            self.store.get_character(*id).await?;
            for relation in self.store.relations_for(*id).await? {
                if seen.insert(relation.id) {
                    relations.push(relation);
                }
            }
        }
        Ok(RelationshipsOutput {
            relationships: self.name_relations(relations).await?,
        })
    }

    async fn name_relations(&self, relations: Vec<Relation>) -> Result<Vec<NamedRelation>> {
        let mut names: BTreeMap<Uuid, Option<String>> = BTreeMap::new();
        let mut out = Vec::with_capacity(relations.len());
        for relation in relations {
            for id in [relation.source_id, relation.target_id] {
                if !names.contains_key(&id) {
                    let name = self.store.find_character(id).await?.map(|c| c.name);
                    names.insert(id, name);
                }
            }
            out.push(NamedRelation {
                source_name: names.get(&relation.source_id).cloned().flatten(),
                target_name: names.get(&relation.target_id).cloned().flatten(),
                relation,
            });
        }
        Ok(out)
    }

    // =========================================================================
    // Provider reasoning
    // =========================================================================

    pub async fn generate_tags(&self, args: GenerateTagsArgs, deadline: Deadline) -> Result<TagsOutput> {
        args.validate()?;
        let generated = match (args.description, args.character_id) {
            (Some(description), _) => self.tags.generate(&description, deadline).await?,
            (None, Some(id)) => {
                let character = self.store.get_character(id).await?;
                let facts = self.store.facts_for(id, Some(TAG_CONTEXT_FACTS)).await?;
                if character.description.is_empty() && facts.is_empty() {
                    return Err(LoreError::validation(format!(
                        "character {} has no description or facts to tag",
                        id
                    )));
                }
                self.tags
                    .generate_for_character(&character, &facts, deadline)
                    .await?
            }
            (None, None) => {
                return Err(LoreError::validation(
                    "exactly one of description or character_id is required",
                ))
            }
        };
        Ok(TagsOutput {
            character_id: args.character_id,
            confidence_scores: generated
                .iter()
                .map(|t| (t.tag.clone(), t.confidence))
                .collect(),
            tags: generated.into_iter().map(|t| t.tag).collect(),
        })
    }

    pub async fn analyze_relationships(
        &self,
        args: AnalyzeRelationshipsArgs,
        deadline: Deadline,
    ) -> Result<RelationshipAnalysis> {
        args.validate()?;
        self.relationships
            .analyze(&args.character_ids, args.context.as_deref(), deadline)
            .await
    }

    pub async fn summarize(&self, args: CharacterIdArgs, deadline: Deadline) -> Result<CharacterSummary> {
        self.profiler.summarize(args.character_id, deadline).await
    }

    pub async fn suggest_development(
        &self,
        args: SuggestDevelopmentArgs,
        deadline: Deadline,
    ) -> Result<DevelopmentSuggestions> {
        args.validate()?;
        self.profiler
            .suggest_development(args.character_id, args.context.as_deref(), deadline)
            .await
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn scored_fact(hit: SearchHit<Fact>, character_name: Option<String>) -> ScoredFact {
    ScoredFact {
        fact: hit.entity,
        character_name,
        score: hit.score,
        similarity: hit.similarity,
        lexical_score: hit.lexical_score,
        tag_score: hit.tag_score,
    }
}

fn into_output<T, U>(
    response: SearchResponse<T>,
    mut warnings: Vec<String>,
    map: impl FnMut(SearchHit<T>) -> U,
) -> SearchOutput<U> {
    warnings.extend(response.warnings);
    SearchOutput {
        results: response.hits.into_iter().map(map).collect(),
        vector_search: response.vector_search,
        degraded_reason: response.degraded_reason,
        warnings,
    }
}

// =============================================================================
// Descriptors
// =============================================================================

/// Descriptors for every tool [`ToolService::call`] accepts.
pub fn descriptors() -> Vec<ToolDescriptor> {
    let uuid = json!({"type": "string", "format": "uuid"});
    let uuids = json!({"type": "array", "items": uuid, "minItems": 1, "maxItems": 100, "uniqueItems": true});
    let strings = json!({"type": "array", "items": {"type": "string"}});
    let tag_mode = json!({"type": "string", "enum": ["any", "all"]});
    let threshold = json!({"type": "number", "minimum": 0.0, "maximum": 1.0});
    let limit = json!({"type": "integer", "minimum": 1});

    vec![
        ToolDescriptor {
            name: "create_character",
            description: "Create a character. Tags are generated from the description.",
            input_schema: object(
                json!({
                    "name": {"type": "string", "minLength": 1, "maxLength": 255},
                    "aliases": {"type": "array", "items": {"type": "string"}, "maxItems": 20},
                    "description": {"type": "string", "maxLength": 10000},
                    "tags": {"type": "array", "items": {"type": "string", "maxLength": 50}, "maxItems": 50}
                }),
                &["name"],
            ),
        },
        ToolDescriptor {
            name: "search_characters",
            description: "Hybrid search over character profiles.",
            input_schema: object(
                json!({
                    "query": {"type": "string", "minLength": 1, "maxLength": 1000},
                    "filters": object(json!({"tags": strings, "fact_types": strings}), &[]),
                    "tag_mode": tag_mode,
                    "similarity_threshold": threshold,
                    "limit": limit
                }),
                &["query"],
            ),
        },
        ToolDescriptor {
            name: "add_character_fact",
            description: "Record a fact about a character and embed its content.",
            input_schema: object(
                json!({
                    "character_id": uuid,
                    "fact_type": {"type": "string", "minLength": 1, "maxLength": 100},
                    "content": {"type": "string", "minLength": 1, "maxLength": 10000},
                    "source": {"type": "string", "maxLength": 500},
                    "tags": strings
                }),
                &["character_id", "fact_type", "content"],
            ),
        },
        ToolDescriptor {
            name: "search_facts",
            description: "Hybrid search over facts, optionally scoped to characters.",
            input_schema: object(
                json!({
                    "query": {"type": "string", "minLength": 1, "maxLength": 1000},
                    "character_names": strings,
                    "character_ids": uuids,
                    "fact_types": strings,
                    "tags": strings,
                    "tag_mode": tag_mode,
                    "similarity_threshold": threshold,
                    "limit": limit
                }),
                &["query"],
            ),
        },
        ToolDescriptor {
            name: "generate_character_tags",
            description: "Suggest tags for a description or a stored character.",
            input_schema: object(
                json!({
                    "description": {"type": "string", "minLength": 1, "maxLength": 10000},
                    "character_id": uuid
                }),
                &[],
            ),
        },
        ToolDescriptor {
            name: "analyze_character_relationships",
            description: "Infer relationships among characters and trace indirect links.",
            input_schema: object(
                json!({
                    "character_ids": {"type": "array", "items": uuid, "minItems": 2, "maxItems": 100, "uniqueItems": true},
                    "context": {"type": "string"}
                }),
                &["character_ids"],
            ),
        },
        ToolDescriptor {
            name: "get_character",
            description: "A character with its facts and relations.",
            input_schema: object(json!({"character_id": uuid}), &["character_id"]),
        },
        ToolDescriptor {
            name: "delete_character",
            description: "Delete a character with its facts and relations.",
            input_schema: object(json!({"character_id": uuid}), &["character_id"]),
        },
        ToolDescriptor {
            name: "create_relationship",
            description: "Record a directed relationship between two characters.",
            input_schema: object(
                json!({
                    "source_id": uuid,
                    "target_id": uuid,
                    "relation_type": {"type": "string", "minLength": 1, "maxLength": 100},
                    "description": {"type": "string", "maxLength": 2000},
                    "strength": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                }),
                &["source_id", "target_id", "relation_type"],
            ),
        },
        ToolDescriptor {
            name: "get_character_relationships",
            description: "Stored relationships touching any of the characters.",
            input_schema: object(json!({"character_ids": uuids}), &["character_ids"]),
        },
        ToolDescriptor {
            name: "summarize_character",
            description: "A written summary of a character.",
            input_schema: object(json!({"character_id": uuid}), &["character_id"]),
        },
        ToolDescriptor {
            name: "suggest_character_development",
            description: "Development ideas for a character.",
            input_schema: object(
                json!({"character_id": uuid, "context": {"type": "string"}}),
                &["character_id"],
            ),
        },
    ]
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false
    })
}
