//! The knowledge store: characters, facts, relations and their vectors.
//!
//! SQLite is the source of truth. Each entity kind also has an in-memory
//! [`VectorIndex`] that is rebuilt from the database on open and updated after
//! every committed write. Writes run in `BEGIN IMMEDIATE` transactions, so two
//! writers never interleave on the same row.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lore_core::config::StorageConfig;
use lore_core::error::{LoreError, Result};
use lore_core::text::{label_key, trigram_similarity};
use lore_core::types::{
    Character, EntityKind, Fact, Relation, SearchFilters, StoreStats, TagMatchMode,
};

use crate::db::Database;
use crate::index::{IndexMode, IvfParams, VectorIndex, VectorMeta};
use crate::lexical::{
    character_filter_sql, fact_filter_sql, like_pattern, trigram_match_expression,
    LEXICAL_CANDIDATE_LIMIT,
};

const CHARACTER_COLUMNS: &str = "c.id, c.name, c.aliases, c.tags, c.description, \
     c.embedding, c.created_at, c.updated_at";

const FACT_COLUMNS: &str = "f.id, f.character_id, f.fact_type, f.content, f.source, f.tags, \
     f.embedding, f.created_at, f.updated_at";

const RELATION_COLUMNS: &str = "r.id, r.source_id, r.target_id, r.relation_type, \
     r.description, r.strength, r.embedding, r.created_at, r.updated_at";

/// Upper bound on rows pulled by a tag query.
const TAG_CANDIDATE_LIMIT: usize = 500;

/// An entity with its cosine similarity to a query vector.
#[derive(Debug, Clone, Serialize)]
pub struct VectorMatch<T> {
    pub entity: T,
    pub similarity: f64,
}

impl<T> VectorMatch<T> {
    /// Cosine distance, `1 - similarity`.
    pub fn distance(&self) -> f64 {
        1.0 - self.similarity
    }
}

/// An entity with its trigram match score against a lexical pattern.
#[derive(Debug, Clone, Serialize)]
pub struct LexicalMatch<T> {
    pub entity: T,
    pub score: f64,
}

/// What a cascading character delete removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub facts_removed: usize,
    pub relations_removed: usize,
}

/// Which entities an embedding backlog query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BacklogScope {
    /// Entities without a usable vector (missing or wrong dimension).
    Pending,
    /// Every entity with embeddable text.
    All,
}

/// Text awaiting (re-)embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingJob {
    pub kind: EntityKind,
    pub id: Uuid,
    pub text: String,
}

/// Durable store for the knowledge base.
#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    db: Arc<Database>,
    dimension: usize,
    acquire_timeout: Duration,
    characters_index: VectorIndex,
    facts_index: VectorIndex,
    relations_index: VectorIndex,
    /// Stamped on every write inside its transaction, so index updates can
    /// be ordered by commit even when they are applied out of order.
    write_version: Arc<AtomicU64>,
}

impl KnowledgeStore {
    /// Open the store over `db` and load every stored vector into the indexes.
    pub async fn open(db: Arc<Database>, dimension: usize, config: &StorageConfig) -> Result<Self> {
        let params = IvfParams::from(config);
        let store = Self {
            acquire_timeout: db.acquire_timeout(),
            db,
            dimension,
            characters_index: VectorIndex::new(dimension, params.clone()),
            facts_index: VectorIndex::new(dimension, params.clone()),
            relations_index: VectorIndex::new(dimension, params),
            write_version: Arc::new(AtomicU64::new(0)),
        };
        store.rebuild_indexes().await?;
        Ok(store)
    }

    /// A handle to the same store whose calls wait at most `timeout` for a
    /// pooled connection.
    pub fn with_acquire_timeout(&self, timeout: Duration) -> Self {
        Self {
            acquire_timeout: timeout,
            ..self.clone()
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        self.db.with_conn_within(self.acquire_timeout, f).await
    }

    // =========================================================================
    // Characters
    // =========================================================================

    /// Persist a new character.
    pub async fn create_character(&self, character: &Character) -> Result<()> {
        character.validate()?;
        self.check_vector(EntityKind::Character, character.id, character.embedding.as_deref())?;

        let version = self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            tx.execute(
                "INSERT INTO characters
                    (id, name, name_key, aliases, tags, description, embedding, embedding_dim,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    character.id.to_string(),
                    character.name,
                    label_key(&character.name),
                    serde_json::to_string(&character.aliases)?,
                    serde_json::to_string(&character.tags)?,
                    character.description,
                    character.embedding.as_deref().map(encode_vector),
                    character.embedding.as_ref().map(|v| v.len() as i64),
                    millis(&character.created_at),
                    millis(&character.updated_at),
                ],
            )
            .map_err(|e| LoreError::Storage(format!("Failed to save character: {}", e)))?;
            write_character_labels(&tx, character)?;
            let version = self.next_write_version();
            tx.commit().map_err(db_err)?;
            Ok(version)
        })
        .await?;

        self.index_character(character, version)?;
        info!(character_id = %character.id, name = %character.name, "Character created");
        Ok(())
    }

    /// Fetch a character, failing with `NotFound` if it does not exist.
    pub async fn get_character(&self, id: Uuid) -> Result<Character> {
        let character = self
            .find_character(id)
            .await?
            .ok_or_else(|| LoreError::not_found("character", id))?;
        self.check_vector(EntityKind::Character, id, character.embedding.as_deref())?;
        Ok(character)
    }

    /// Fetch a character if it exists.
    pub async fn find_character(&self, id: Uuid) -> Result<Option<Character>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM characters c WHERE c.id = ?1", CHARACTER_COLUMNS);
            conn.query_row(&sql, params![id.to_string()], |row| Ok(row_to_character(row)))
                .optional()
                .map_err(db_err)?
                .transpose()
        })
        .await
    }

    /// Characters whose name or one of whose aliases matches case-insensitively.
    pub async fn find_characters_by_name(&self, name: &str) -> Result<Vec<Character>> {
        let key = label_key(name);
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM characters c
                     WHERE c.name_key = ?1
                        OR c.id IN (SELECT character_id FROM character_aliases WHERE alias_key = ?1)
                     ORDER BY c.created_at ASC, c.id ASC",
                    CHARACTER_COLUMNS
                );
                query_rows(conn, &sql, params![key], row_to_character)
            })
            .await?;
        Ok(self.consistent(EntityKind::Character, rows))
    }

    /// Page through characters ordered by name.
    pub async fn list_characters(&self, limit: usize, offset: usize) -> Result<Vec<Character>> {
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM characters c ORDER BY c.name_key ASC, c.id ASC
                     LIMIT ?1 OFFSET ?2",
                    CHARACTER_COLUMNS
                );
                query_rows(conn, &sql, params![limit as i64, offset as i64], row_to_character)
            })
            .await?;
        Ok(self.consistent(EntityKind::Character, rows))
    }

    /// Overwrite a character's fields. Returns the stored version.
    pub async fn update_character(&self, character: &Character) -> Result<Character> {
        character.validate()?;
        self.check_vector(EntityKind::Character, character.id, character.embedding.as_deref())?;
        let mut updated = character.clone();
        updated.updated_at = Utc::now();

        let version = self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let n = tx
                .execute(
                    "UPDATE characters
                     SET name = ?2, name_key = ?3, aliases = ?4, tags = ?5, description = ?6,
                         embedding = ?7, embedding_dim = ?8, updated_at = ?9
                     WHERE id = ?1",
                    params![
                        updated.id.to_string(),
                        updated.name,
                        label_key(&updated.name),
                        serde_json::to_string(&updated.aliases)?,
                        serde_json::to_string(&updated.tags)?,
                        updated.description,
                        updated.embedding.as_deref().map(encode_vector),
                        updated.embedding.as_ref().map(|v| v.len() as i64),
                        millis(&updated.updated_at),
                    ],
                )
                .map_err(|e| LoreError::Storage(format!("Failed to update character: {}", e)))?;
            if n == 0 {
                return Err(LoreError::not_found("character", updated.id));
            }
            tx.execute(
                "DELETE FROM character_aliases WHERE character_id = ?1",
                params![updated.id.to_string()],
            )
            .map_err(db_err)?;
            tx.execute(
                "DELETE FROM character_tags WHERE character_id = ?1",
                params![updated.id.to_string()],
            )
            .map_err(db_err)?;
            write_character_labels(&tx, &updated)?;
            let version = self.next_write_version();
            tx.commit().map_err(db_err)?;
            Ok(version)
        })
        .await?;

        self.index_character(&updated, version)?;
        debug!(character_id = %updated.id, "Character updated");
        Ok(updated)
    }

    /// Delete a character together with its facts and every relation that
    /// references it. All or nothing.
    pub async fn delete_character(&self, id: Uuid) -> Result<DeleteSummary> {
        let (fact_ids, relation_ids, version) = self
            .with_conn(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db_err)?;
                let fact_ids = query_ids(
                    &tx,
                    "SELECT id FROM facts WHERE character_id = ?1",
                    params![id.to_string()],
                )?;
                let relation_ids = query_ids(
                    &tx,
                    "SELECT id FROM relations WHERE source_id = ?1 OR target_id = ?1",
                    params![id.to_string()],
                )?;
                let n = tx
                    .execute("DELETE FROM characters WHERE id = ?1", params![id.to_string()])
                    .map_err(|e| LoreError::Storage(format!("Failed to delete character: {}", e)))?;
                if n == 0 {
                    return Err(LoreError::not_found("character", id));
                }
                let version = self.next_write_version();
                tx.commit().map_err(db_err)?;
                Ok((fact_ids, relation_ids, version))
            })
            .await?;

        self.characters_index.delete_versioned(id, version)?;
        for fact_id in &fact_ids {
            self.facts_index.delete_versioned(*fact_id, version)?;
        }
        for relation_id in &relation_ids {
            self.relations_index.delete_versioned(*relation_id, version)?;
        }

        let summary = DeleteSummary {
            facts_removed: fact_ids.len(),
            relations_removed: relation_ids.len(),
        };
        info!(
            character_id = %id,
            facts = summary.facts_removed,
            relations = summary.relations_removed,
            "Character deleted"
        );
        Ok(summary)
    }

    // =========================================================================
    // Facts
    // =========================================================================

    /// Persist a new fact. Fails with `NotFound` if the owner does not exist.
    pub async fn add_fact(&self, fact: &Fact) -> Result<()> {
        fact.validate()?;
        self.check_vector(EntityKind::Fact, fact.id, fact.embedding.as_deref())?;

        let version = self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            if !exists(&tx, "characters", fact.character_id)? {
                return Err(LoreError::not_found("character", fact.character_id));
            }
            tx.execute(
                "INSERT INTO facts
                    (id, character_id, fact_type, fact_type_key, content, source, tags,
                     embedding, embedding_dim, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    fact.id.to_string(),
                    fact.character_id.to_string(),
                    fact.fact_type,
                    label_key(&fact.fact_type),
                    fact.content,
                    fact.source,
                    serde_json::to_string(&fact.tags)?,
                    fact.embedding.as_deref().map(encode_vector),
                    fact.embedding.as_ref().map(|v| v.len() as i64),
                    millis(&fact.created_at),
                    millis(&fact.updated_at),
                ],
            )
            .map_err(|e| LoreError::Storage(format!("Failed to save fact: {}", e)))?;
            write_fact_tags(&tx, fact)?;
            let version = self.next_write_version();
            tx.commit().map_err(db_err)?;
            Ok(version)
        })
        .await?;

        self.index_fact(fact, version)?;
        debug!(fact_id = %fact.id, character_id = %fact.character_id, "Fact added");
        Ok(())
    }

    pub async fn get_fact(&self, id: Uuid) -> Result<Fact> {
        let fact = self
            .with_conn(|conn| {
                let sql = format!("SELECT {} FROM facts f WHERE f.id = ?1", FACT_COLUMNS);
                conn.query_row(&sql, params![id.to_string()], |row| Ok(row_to_fact(row)))
                    .optional()
                    .map_err(db_err)?
                    .transpose()
            })
            .await?
            .ok_or_else(|| LoreError::not_found("fact", id))?;
        self.check_vector(EntityKind::Fact, id, fact.embedding.as_deref())?;
        Ok(fact)
    }

    /// A character's facts, most recently updated first.
    pub async fn facts_for(&self, character_id: Uuid, limit: Option<usize>) -> Result<Vec<Fact>> {
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM facts f WHERE f.character_id = ?1
                     ORDER BY f.updated_at DESC, f.id ASC LIMIT ?2",
                    FACT_COLUMNS
                );
                let limit = limit.map(|l| l as i64).unwrap_or(-1);
                query_rows(conn, &sql, params![character_id.to_string(), limit], row_to_fact)
            })
            .await?;
        Ok(self.consistent(EntityKind::Fact, rows))
    }

    /// Overwrite a fact's fields. Returns the stored version.
    pub async fn update_fact(&self, fact: &Fact) -> Result<Fact> {
        fact.validate()?;
        self.check_vector(EntityKind::Fact, fact.id, fact.embedding.as_deref())?;
        let mut updated = fact.clone();
        updated.updated_at = Utc::now();

        let version = self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            let n = tx
                .execute(
                    "UPDATE facts
                     SET fact_type = ?2, fact_type_key = ?3, content = ?4, source = ?5, tags = ?6,
                         embedding = ?7, embedding_dim = ?8, updated_at = ?9
                     WHERE id = ?1",
                    params![
                        updated.id.to_string(),
                        updated.fact_type,
                        label_key(&updated.fact_type),
                        updated.content,
                        updated.source,
                        serde_json::to_string(&updated.tags)?,
                        updated.embedding.as_deref().map(encode_vector),
                        updated.embedding.as_ref().map(|v| v.len() as i64),
                        millis(&updated.updated_at),
                    ],
                )
                .map_err(|e| LoreError::Storage(format!("Failed to update fact: {}", e)))?;
            if n == 0 {
                return Err(LoreError::not_found("fact", updated.id));
            }
            tx.execute(
                "DELETE FROM fact_tags WHERE fact_id = ?1",
                params![updated.id.to_string()],
            )
            .map_err(db_err)?;
            write_fact_tags(&tx, &updated)?;
            let version = self.next_write_version();
            tx.commit().map_err(db_err)?;
            Ok(version)
        })
        .await?;

        self.index_fact(&updated, version)?;
        Ok(updated)
    }

    pub async fn delete_fact(&self, id: Uuid) -> Result<()> {
        let version = self
            .with_conn(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db_err)?;
                let n = tx
                    .execute("DELETE FROM facts WHERE id = ?1", params![id.to_string()])
                    .map_err(|e| LoreError::Storage(format!("Failed to delete fact: {}", e)))?;
                if n == 0 {
                    return Err(LoreError::not_found("fact", id));
                }
                let version = self.next_write_version();
                tx.commit().map_err(db_err)?;
                Ok(version)
            })
            .await?;
        self.facts_index.delete_versioned(id, version)
    }

    // =========================================================================
    // Relations
    // =========================================================================

    /// Persist a new relation.
    ///
    /// Both endpoints must exist and differ, and (source, target, type) must be
    /// unique.
    pub async fn create_relation(&self, relation: &Relation) -> Result<()> {
        relation.validate()?;
        self.check_vector(EntityKind::Relation, relation.id, relation.embedding.as_deref())?;

        let version = self.with_conn(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db_err)?;
            for endpoint in [relation.source_id, relation.target_id] {
                if !exists(&tx, "characters", endpoint)? {
                    return Err(LoreError::not_found("character", endpoint));
                }
            }
            let duplicate: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM relations
                     WHERE source_id = ?1 AND target_id = ?2 AND relation_type = ?3)",
                    params![
                        relation.source_id.to_string(),
                        relation.target_id.to_string(),
                        relation.relation_type
                    ],
                    |row| row.get(0),
                )
                .map_err(db_err)?;
            if duplicate {
                return Err(LoreError::validation(format!(
                    "relation '{}' from {} to {} already exists",
                    relation.relation_type, relation.source_id, relation.target_id
                )));
            }
            tx.execute(
                "INSERT INTO relations
                    (id, source_id, target_id, relation_type, description, strength,
                     embedding, embedding_dim, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    relation.id.to_string(),
                    relation.source_id.to_string(),
                    relation.target_id.to_string(),
                    relation.relation_type,
                    relation.description,
                    relation.strength,
                    relation.embedding.as_deref().map(encode_vector),
                    relation.embedding.as_ref().map(|v| v.len() as i64),
                    millis(&relation.created_at),
                    millis(&relation.updated_at),
                ],
            )
            .map_err(|e| LoreError::Storage(format!("Failed to save relation: {}", e)))?;
            let version = self.next_write_version();
            tx.commit().map_err(db_err)?;
            Ok(version)
        })
        .await?;

        self.index_relation(relation, version)?;
        info!(
            relation_id = %relation.id,
            source = %relation.source_id,
            target = %relation.target_id,
            relation_type = %relation.relation_type,
            "Relation created"
        );
        Ok(())
    }

    pub async fn get_relation(&self, id: Uuid) -> Result<Relation> {
        let relation = self
            .with_conn(|conn| {
                let sql = format!("SELECT {} FROM relations r WHERE r.id = ?1", RELATION_COLUMNS);
                conn.query_row(&sql, params![id.to_string()], |row| Ok(row_to_relation(row)))
                    .optional()
                    .map_err(db_err)?
                    .transpose()
            })
            .await?
            .ok_or_else(|| LoreError::not_found("relation", id))?;
        self.check_vector(EntityKind::Relation, id, relation.embedding.as_deref())?;
        Ok(relation)
    }

    /// Relations where the character is source or target, strongest first.
    pub async fn relations_for(&self, character_id: Uuid) -> Result<Vec<Relation>> {
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM relations r WHERE r.source_id = ?1 OR r.target_id = ?1
                     ORDER BY r.strength DESC, r.created_at ASC, r.id ASC",
                    RELATION_COLUMNS
                );
                query_rows(conn, &sql, params![character_id.to_string()], row_to_relation)
            })
            .await?;
        Ok(self.consistent(EntityKind::Relation, rows))
    }

    /// Relations whose endpoints are both in `character_ids`.
    pub async fn relations_among(&self, character_ids: &[Uuid]) -> Result<Vec<Relation>> {
        if character_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = character_ids.iter().map(Uuid::to_string).collect();
        let rows = self
            .with_conn(|conn| {
                let ph = placeholders(ids.len(), 1);
                let sql = format!(
                    "SELECT {} FROM relations r
                     WHERE r.source_id IN ({ph}) AND r.target_id IN ({ph})
                     ORDER BY r.strength DESC, r.created_at ASC, r.id ASC",
                    RELATION_COLUMNS
                );
                query_rows(conn, &sql, rusqlite::params_from_iter(ids.iter()), row_to_relation)
            })
            .await?;
        Ok(self.consistent(EntityKind::Relation, rows))
    }

    pub async fn delete_relation(&self, id: Uuid) -> Result<()> {
        let version = self
            .with_conn(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db_err)?;
                let n = tx
                    .execute("DELETE FROM relations WHERE id = ?1", params![id.to_string()])
                    .map_err(|e| LoreError::Storage(format!("Failed to delete relation: {}", e)))?;
                if n == 0 {
                    return Err(LoreError::not_found("relation", id));
                }
                let version = self.next_write_version();
                tx.commit().map_err(db_err)?;
                Ok(version)
            })
            .await?;
        self.relations_index.delete_versioned(id, version)
    }

    // =========================================================================
    // Vector similarity
    // =========================================================================

    /// The `top_k` facts nearest to `vector` that pass `filters`.
    pub async fn find_facts_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<VectorMatch<Fact>>> {
        let type_keys: HashSet<String> = filters.fact_types.iter().map(|t| label_key(t)).collect();
        let owners: HashSet<Uuid> = filters.character_ids.iter().copied().collect();
        let admit = |m: &VectorMeta| {
            (type_keys.is_empty() || type_keys.contains(&m.label))
                && (owners.is_empty() || m.owner.is_some_and(|o| owners.contains(&o)))
        };
        let hits = self.facts_index.search(vector, top_k, &admit)?;

        let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let mut facts = self.load_facts(&ids).await?;
        Ok(hits
            .into_iter()
            .filter_map(|h| {
                facts.remove(&h.id).map(|entity| VectorMatch {
                    entity,
                    similarity: h.similarity,
                })
            })
            .collect())
    }

    /// The `top_k` characters whose profile vector is nearest to `vector`.
    pub async fn find_characters_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<VectorMatch<Character>>> {
        let allowed = self.allowed_characters(filters).await?;
        let admit = |m: &VectorMeta| match (&allowed, m.owner) {
            (None, _) => true,
            (Some(set), Some(id)) => set.contains(&id),
            (Some(_), None) => false,
        };
        let hits = self.characters_index.search(vector, top_k, &admit)?;

        let ids: Vec<Uuid> = hits.iter().map(|h| h.id).collect();
        let mut characters = self.load_characters(&ids).await?;
        Ok(hits
            .into_iter()
            .filter_map(|h| {
                characters.remove(&h.id).map(|entity| VectorMatch {
                    entity,
                    similarity: h.similarity,
                })
            })
            .collect())
    }

    /// The `top_k` relations whose description vector is nearest to `vector`.
    pub async fn find_relations_by_vector(
        &self,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch<Relation>>> {
        let hits = self.relations_index.search(vector, top_k, &|_: &VectorMeta| true)?;
        let mut out = Vec::with_capacity(hits.len());
        for hit in hits {
            match self.get_relation(hit.id).await {
                Ok(entity) => out.push(VectorMatch {
                    entity,
                    similarity: hit.similarity,
                }),
                Err(LoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Indexed vector for a fact, unit-normalized.
    pub fn fact_vector(&self, id: Uuid) -> Option<Vec<f32>> {
        self.facts_index.get(id)
    }

    /// Indexed profile vector for a character, unit-normalized.
    pub fn character_vector(&self, id: Uuid) -> Option<Vec<f32>> {
        self.characters_index.get(id)
    }

    // =========================================================================
    // Lexical
    // =========================================================================

    /// Facts whose content fuzzily matches `pattern` by trigram coverage.
    ///
    /// Returns at most `limit` matches scoring at least `min_score`, best first.
    pub async fn find_facts_by_lexical(
        &self,
        pattern: &str,
        filters: &SearchFilters,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<LexicalMatch<Fact>>> {
        if pattern.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (filter_sql, filter_values) = fact_filter_sql(filters, 2);
        let rows = self
            .with_conn(|conn| {
                let (sql, first) = match trigram_match_expression(pattern) {
                    Some(expr) => (
                        format!(
                            "SELECT {} FROM facts_fts
                             JOIN facts f ON f.seq = facts_fts.rowid
                             WHERE facts_fts MATCH ?1{}
                             ORDER BY facts_fts.rank
                             LIMIT {}",
                            FACT_COLUMNS, filter_sql, LEXICAL_CANDIDATE_LIMIT
                        ),
                        expr,
                    ),
                    None => (
                        format!(
                            "SELECT {} FROM facts f
                             WHERE f.content LIKE ?1 ESCAPE '\\'{}
                             ORDER BY f.updated_at DESC
                             LIMIT {}",
                            FACT_COLUMNS, filter_sql, LEXICAL_CANDIDATE_LIMIT
                        ),
                        like_pattern(pattern),
                    ),
                };
                let values = std::iter::once(&first).chain(filter_values.iter());
                query_rows(conn, &sql, rusqlite::params_from_iter(values), row_to_fact)
            })
            .await?;

        let mut matches: Vec<LexicalMatch<Fact>> = self
            .consistent(EntityKind::Fact, rows)
            .into_iter()
            .map(|f| LexicalMatch {
                score: trigram_similarity(pattern, &f.content),
                entity: f,
            })
            .filter(|m| m.score >= min_score && m.score > 0.0)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entity.updated_at.cmp(&a.entity.updated_at))
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Characters whose name, aliases or description fuzzily match `pattern`.
    ///
    /// The score is the best trigram coverage over those fields.
    pub async fn find_characters_by_lexical(
        &self,
        pattern: &str,
        filters: &SearchFilters,
        min_score: f64,
        limit: usize,
    ) -> Result<Vec<LexicalMatch<Character>>> {
        if pattern.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let (filter_sql, filter_values) = character_filter_sql(filters, 2);
        let rows = self
            .with_conn(|conn| {
                let (sql, first) = match trigram_match_expression(pattern) {
                    Some(expr) => (
                        format!(
                            "SELECT {} FROM characters_fts
                             JOIN characters c ON c.seq = characters_fts.rowid
                             WHERE characters_fts MATCH ?1{}
                             ORDER BY characters_fts.rank
                             LIMIT {}",
                            CHARACTER_COLUMNS, filter_sql, LEXICAL_CANDIDATE_LIMIT
                        ),
                        expr,
                    ),
                    None => (
                        format!(
                            "SELECT {} FROM characters c
                             WHERE (c.name LIKE ?1 ESCAPE '\\'
                                OR c.aliases LIKE ?1 ESCAPE '\\'
                                OR c.description LIKE ?1 ESCAPE '\\'){}
                             ORDER BY c.updated_at DESC
                             LIMIT {}",
                            CHARACTER_COLUMNS, filter_sql, LEXICAL_CANDIDATE_LIMIT
                        ),
                        like_pattern(pattern),
                    ),
                };
                let values = std::iter::once(&first).chain(filter_values.iter());
                query_rows(conn, &sql, rusqlite::params_from_iter(values), row_to_character)
            })
            .await?;

        let mut matches: Vec<LexicalMatch<Character>> = self
            .consistent(EntityKind::Character, rows)
            .into_iter()
            .map(|c| LexicalMatch {
                score: character_lexical_score(pattern, &c),
                entity: c,
            })
            .filter(|m| m.score >= min_score && m.score > 0.0)
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.entity.updated_at.cmp(&a.entity.updated_at))
                .then_with(|| a.entity.id.cmp(&b.entity.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    // =========================================================================
    // Tags
    // =========================================================================

    /// Facts carrying any (or all) of `tags`, compared case-insensitively.
    pub async fn find_facts_by_tags(
        &self,
        tags: &[String],
        mode: TagMatchMode,
        filters: &SearchFilters,
    ) -> Result<Vec<Fact>> {
        let keys = tag_keys(tags);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let required = match mode {
            TagMatchMode::Any => 1,
            TagMatchMode::All => keys.len(),
        };
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM facts f
                     WHERE f.id IN (
                        SELECT fact_id FROM fact_tags WHERE tag_key IN ({})
                        GROUP BY fact_id HAVING COUNT(*) >= {}
                     )
                     ORDER BY f.updated_at DESC, f.id ASC
                     LIMIT {}",
                    FACT_COLUMNS,
                    placeholders(keys.len(), 1),
                    required,
                    TAG_CANDIDATE_LIMIT
                );
                query_rows(conn, &sql, rusqlite::params_from_iter(keys.iter()), row_to_fact)
            })
            .await?;
        Ok(self
            .consistent(EntityKind::Fact, rows)
            .into_iter()
            .filter(|f| filters.admits_fact(f))
            .collect())
    }

    /// Characters carrying any (or all) of `tags`, compared case-insensitively.
    pub async fn find_characters_by_tags(
        &self,
        tags: &[String],
        mode: TagMatchMode,
        filters: &SearchFilters,
    ) -> Result<Vec<Character>> {
        let keys = tag_keys(tags);
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let required = match mode {
            TagMatchMode::Any => 1,
            TagMatchMode::All => keys.len(),
        };
        let allowed = self.allowed_characters(filters).await?;
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM characters c
                     WHERE c.id IN (
                        SELECT character_id FROM character_tags WHERE tag_key IN ({})
                        GROUP BY character_id HAVING COUNT(*) >= {}
                     )
                     ORDER BY c.updated_at DESC, c.id ASC
                     LIMIT {}",
                    CHARACTER_COLUMNS,
                    placeholders(keys.len(), 1),
                    required,
                    TAG_CANDIDATE_LIMIT
                );
                query_rows(conn, &sql, rusqlite::params_from_iter(keys.iter()), row_to_character)
            })
            .await?;
        Ok(self
            .consistent(EntityKind::Character, rows)
            .into_iter()
            .filter(|c| allowed.as_ref().map_or(true, |set| set.contains(&c.id)))
            .collect())
    }

    /// Ids of characters owning at least one fact of the given types.
    pub async fn characters_with_fact_types(&self, fact_types: &[String]) -> Result<HashSet<Uuid>> {
        let keys = tag_keys(fact_types);
        if keys.is_empty() {
            return Ok(HashSet::new());
        }
        let ids = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT DISTINCT character_id FROM facts WHERE fact_type_key IN ({})",
                    placeholders(keys.len(), 1)
                );
                query_ids(conn, &sql, rusqlite::params_from_iter(keys.iter()))
            })
            .await?;
        Ok(ids.into_iter().collect())
    }

    /// Character ids admitted by `filters`, or `None` when unrestricted.
    async fn allowed_characters(&self, filters: &SearchFilters) -> Result<Option<HashSet<Uuid>>> {
        let mut allowed: Option<HashSet<Uuid>> = None;
        if !filters.character_ids.is_empty() {
            allowed = Some(filters.character_ids.iter().copied().collect());
        }
        if !filters.fact_types.is_empty() {
            let with_types = self.characters_with_fact_types(&filters.fact_types).await?;
            allowed = Some(match allowed {
                Some(set) => set.intersection(&with_types).copied().collect(),
                None => with_types,
            });
        }
        Ok(allowed)
    }

    // =========================================================================
    // Embedding maintenance
    // =========================================================================

    /// Attach (or replace) the vector of an entity.
    pub async fn set_embedding(&self, kind: EntityKind, id: Uuid, vector: &[f32]) -> Result<()> {
        self.check_vector(kind, id, Some(vector))?;
        let table = table_for(kind);
        let (meta, version) = self
            .with_conn(|conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db_err)?;
                let n = tx
                    .execute(
                        &format!(
                            "UPDATE {} SET embedding = ?2, embedding_dim = ?3 WHERE id = ?1",
                            table
                        ),
                        params![id.to_string(), encode_vector(vector), vector.len() as i64],
                    )
                    .map_err(|e| LoreError::Storage(format!("Failed to store embedding: {}", e)))?;
                if n == 0 {
                    return Err(LoreError::not_found(kind.as_str(), id));
                }
                let meta = vector_meta(&tx, kind, id)?;
                let version = self.next_write_version();
                tx.commit().map_err(db_err)?;
                Ok((meta, version))
            })
            .await?;

        apply_to_index(self.index_for(kind), id, Some(vector), meta, version)?;
        debug!(kind = kind.as_str(), id = %id, "Embedding stored");
        Ok(())
    }

    /// Up to `limit` entities of `kind` with text but no usable vector.
    pub async fn pending_embeddings(&self, kind: EntityKind, limit: usize) -> Result<Vec<EmbeddingJob>> {
        self.embedding_backlog(kind, BacklogScope::Pending, 0, limit).await
    }

    /// Entities whose text needs a vector, in stable id order.
    pub async fn embedding_backlog(
        &self,
        kind: EntityKind,
        scope: BacklogScope,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<EmbeddingJob>> {
        let mut conditions = Vec::new();
        let mut args = vec![limit as i64, offset as i64];
        if scope == BacklogScope::Pending {
            conditions.push("(embedding IS NULL OR embedding_dim != ?3)");
            args.push(self.dimension as i64);
        }
        if kind == EntityKind::Relation {
            conditions.push("description != ''");
        }
        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        self.with_conn(|conn| {
            let args = rusqlite::params_from_iter(args.iter());
            let jobs = match kind {
                EntityKind::Character => {
                    let sql = format!(
                        "SELECT {} FROM characters c {} ORDER BY c.id LIMIT ?1 OFFSET ?2",
                        CHARACTER_COLUMNS, filter
                    );
                    query_rows(conn, &sql, args, row_to_character)?
                        .into_iter()
                        .map(|c| EmbeddingJob {
                            kind,
                            id: c.id,
                            text: c.profile_text(),
                        })
                        .collect()
                }
                EntityKind::Fact => {
                    let sql = format!(
                        "SELECT {} FROM facts f {} ORDER BY f.id LIMIT ?1 OFFSET ?2",
                        FACT_COLUMNS, filter
                    );
                    query_rows(conn, &sql, args, row_to_fact)?
                        .into_iter()
                        .map(|f| EmbeddingJob {
                            kind,
                            id: f.id,
                            text: f.content,
                        })
                        .collect()
                }
                EntityKind::Relation => {
                    let sql = format!(
                        "SELECT {} FROM relations r {} ORDER BY r.id LIMIT ?1 OFFSET ?2",
                        RELATION_COLUMNS, filter
                    );
                    query_rows(conn, &sql, args, row_to_relation)?
                        .into_iter()
                        .map(|r| EmbeddingJob {
                            kind,
                            id: r.id,
                            text: r.description,
                        })
                        .collect()
                }
            };
            Ok(jobs)
        })
        .await
    }

    /// Reload every index from the database.
    ///
    /// Vectors whose length differs from the configured dimension are left
    /// out of the index and reported; they need a re-embedding pass.
    pub async fn rebuild_indexes(&self) -> Result<()> {
        let dimension = self.dimension;
        let rows = self
            .with_conn(|conn| {
                let mut rows = Vec::new();
                let queries = [
                    (
                        EntityKind::Character,
                        "SELECT id, embedding, NULL, '' FROM characters WHERE embedding IS NOT NULL",
                    ),
                    (
                        EntityKind::Fact,
                        "SELECT id, embedding, character_id, fact_type_key FROM facts
                         WHERE embedding IS NOT NULL",
                    ),
                    (
                        EntityKind::Relation,
                        "SELECT id, embedding, source_id, relation_type FROM relations
                         WHERE embedding IS NOT NULL",
                    ),
                ];
                for (kind, sql) in queries {
                    let mut stmt = conn.prepare(sql).map_err(db_err)?;
                    let mapped = stmt
                        .query_map([], |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Vec<u8>>(1)?,
                                row.get::<_, Option<String>>(2)?,
                                row.get::<_, String>(3)?,
                            ))
                        })
                        .map_err(db_err)?;
                    for row in mapped {
                        let (id, blob, owner, label) = row.map_err(db_err)?;
                        rows.push((kind, parse_uuid(&id)?, decode_vector(&blob), owner, label));
                    }
                }
                Ok(rows)
            })
            .await?;

        for index in [&self.characters_index, &self.facts_index, &self.relations_index] {
            index.clear()?;
        }
        let mut mismatched = 0usize;
        for (kind, id, vector, owner, label) in rows {
            if vector.len() != dimension {
                mismatched += 1;
                continue;
            }
            let owner = match (kind, owner) {
                (EntityKind::Character, _) => Some(id),
                (_, Some(o)) => Some(parse_uuid(&o)?),
                (_, None) => None,
            };
            self.index_for(kind)
                .insert(id, &vector, VectorMeta { owner, label: label_key(&label) })?;
        }
        for index in [&self.characters_index, &self.facts_index, &self.relations_index] {
            let index = index.clone();
            tokio::task::spawn_blocking(move || index.retrain())
                .await
                .map_err(|e| LoreError::Storage(format!("Index training task failed: {}", e)))??;
        }
        if mismatched > 0 {
            warn!(
                mismatched,
                expected = dimension,
                "Stored vectors with the wrong dimension were not indexed; run a re-embedding pass"
            );
        }
        info!(
            characters = self.characters_index.len(),
            facts = self.facts_index.len(),
            relations = self.relations_index.len(),
            "Vector indexes loaded"
        );
        Ok(())
    }

    /// Aggregate counts.
    pub async fn stats(&self) -> Result<StoreStats> {
        let dimension = self.dimension as i64;
        let mut stats = self
            .with_conn(|conn| {
                let count = |sql: &str| -> Result<u64> {
                    conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                        .map(|n| n as u64)
                        .map_err(db_err)
                };
                let dimension_mismatches = conn
                    .query_row(
                        "SELECT (SELECT COUNT(*) FROM characters
                                 WHERE embedding IS NOT NULL AND embedding_dim != ?1)
                              + (SELECT COUNT(*) FROM facts
                                 WHERE embedding IS NOT NULL AND embedding_dim != ?1)
                              + (SELECT COUNT(*) FROM relations
                                 WHERE embedding IS NOT NULL AND embedding_dim != ?1)",
                        params![dimension],
                        |row| row.get::<_, i64>(0),
                    )
                    .map_err(db_err)? as u64;
                Ok(StoreStats {
                    characters: count("SELECT COUNT(*) FROM characters")?,
                    facts: count("SELECT COUNT(*) FROM facts")?,
                    relations: count("SELECT COUNT(*) FROM relations")?,
                    pending_embeddings: count(
                        "SELECT (SELECT COUNT(*) FROM characters WHERE embedding IS NULL)
                              + (SELECT COUNT(*) FROM facts WHERE embedding IS NULL)
                              + (SELECT COUNT(*) FROM relations
                                 WHERE embedding IS NULL AND description != '')",
                    )?,
                    dimension_mismatches,
                    fact_index_mode: String::new(),
                })
            })
            .await?;
        stats.fact_index_mode = self.facts_index.mode().as_str().to_string();
        Ok(stats)
    }

    pub fn fact_index_mode(&self) -> IndexMode {
        self.facts_index.mode()
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn index_for(&self, kind: EntityKind) -> &VectorIndex {
        match kind {
            EntityKind::Character => &self.characters_index,
            EntityKind::Fact => &self.facts_index,
            EntityKind::Relation => &self.relations_index,
        }
    }

    /// Next write version. Call inside the write transaction, before commit,
    /// so versions follow commit order.
    fn next_write_version(&self) -> u64 {
        self.write_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn index_character(&self, character: &Character, version: u64) -> Result<()> {
        apply_to_index(
            &self.characters_index,
            character.id,
            character.embedding.as_deref(),
            VectorMeta {
                owner: Some(character.id),
                label: String::new(),
            },
            version,
        )
    }

    fn index_fact(&self, fact: &Fact, version: u64) -> Result<()> {
        apply_to_index(
            &self.facts_index,
            fact.id,
            fact.embedding.as_deref(),
            VectorMeta {
                owner: Some(fact.character_id),
                label: label_key(&fact.fact_type),
            },
            version,
        )
    }

    fn index_relation(&self, relation: &Relation, version: u64) -> Result<()> {
        apply_to_index(
            &self.relations_index,
            relation.id,
            relation.embedding.as_deref(),
            VectorMeta {
                owner: Some(relation.source_id),
                label: label_key(&relation.relation_type),
            },
            version,
        )
    }

    /// Reject a vector whose length is not the configured dimension.
    fn check_vector(&self, kind: EntityKind, id: Uuid, vector: Option<&[f32]>) -> Result<()> {
        match vector {
            Some(v) if v.len() != self.dimension => Err(LoreError::DimensionMismatch {
                entity: format!("{} {}", kind.as_str(), id),
                expected: self.dimension,
                actual: v.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Drop entities whose stored vector has the wrong dimension from a bulk
    /// read, logging each one.
    fn consistent<T: HasEmbedding>(&self, kind: EntityKind, rows: Vec<T>) -> Vec<T> {
        rows.into_iter()
            .filter(|row| match self.check_vector(kind, row.entity_id(), row.vector()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Skipping entity with inconsistent vector");
                    false
                }
            })
            .collect()
    }

    async fn load_facts(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Fact>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM facts f WHERE f.id IN ({})",
                    FACT_COLUMNS,
                    placeholders(keys.len(), 1)
                );
                query_rows(conn, &sql, rusqlite::params_from_iter(keys.iter()), row_to_fact)
            })
            .await?;
        Ok(self
            .consistent(EntityKind::Fact, rows)
            .into_iter()
            .map(|f| (f.id, f))
            .collect())
    }

    async fn load_characters(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Character>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let rows = self
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT {} FROM characters c WHERE c.id IN ({})",
                    CHARACTER_COLUMNS,
                    placeholders(keys.len(), 1)
                );
                query_rows(conn, &sql, rusqlite::params_from_iter(keys.iter()), row_to_character)
            })
            .await?;
        Ok(self
            .consistent(EntityKind::Character, rows)
            .into_iter()
            .map(|c| (c.id, c))
            .collect())
    }
}

trait HasEmbedding {
    fn entity_id(&self) -> Uuid;
    fn vector(&self) -> Option<&[f32]>;
}

impl HasEmbedding for Character {
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn vector(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

impl HasEmbedding for Fact {
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn vector(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

impl HasEmbedding for Relation {
    fn entity_id(&self) -> Uuid {
        self.id
    }
    fn vector(&self) -> Option<&[f32]> {
        self.embedding.as_deref()
    }
}

// =============================================================================
// Row helpers
// =============================================================================

/// Apply a committed write to `index`: store the vector, or drop the entry
/// when the write cleared it. Training is scheduled off the caller's thread.
fn apply_to_index(
    index: &VectorIndex,
    id: Uuid,
    vector: Option<&[f32]>,
    meta: VectorMeta,
    version: u64,
) -> Result<()> {
    match vector {
        Some(v) => {
            index.insert_versioned(id, v, meta, version)?;
            index.retrain_in_background();
            Ok(())
        }
        None => index.delete_versioned(id, version),
    }
}

fn db_err(e: rusqlite::Error) -> LoreError {
    LoreError::Storage(e.to_string())
}

fn millis(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| LoreError::Storage(format!("Invalid UUID '{}': {}", s, e)))
}

fn encode_vector(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|x| x.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn placeholders(n: usize, start: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn tag_keys(tags: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    tags.iter()
        .map(|t| label_key(t))
        .filter(|k| !k.is_empty() && seen.insert(k.clone()))
        .collect()
}

fn table_for(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Character => "characters",
        EntityKind::Fact => "facts",
        EntityKind::Relation => "relations",
    }
}

fn exists(conn: &Connection, table: &str, id: Uuid) -> Result<bool> {
    conn.query_row(
        &format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = ?1)", table),
        params![id.to_string()],
        |row| row.get(0),
    )
    .map_err(db_err)
}

fn vector_meta(conn: &Connection, kind: EntityKind, id: Uuid) -> Result<VectorMeta> {
    let sql = match kind {
        EntityKind::Character => return Ok(VectorMeta { owner: Some(id), label: String::new() }),
        EntityKind::Fact => "SELECT character_id, fact_type_key FROM facts WHERE id = ?1",
        EntityKind::Relation => "SELECT source_id, relation_type FROM relations WHERE id = ?1",
    };
    let (owner, label): (String, String) = conn
        .query_row(sql, params![id.to_string()], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(db_err)?;
    Ok(VectorMeta {
        owner: Some(parse_uuid(&owner)?),
        label: label_key(&label),
    })
}

fn query_rows<T, P>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>>
where
    P: rusqlite::Params,
{
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt.query_map(params, |row| Ok(map(row))).map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(db_err)??);
    }
    Ok(out)
}

fn query_ids<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(sql).map_err(db_err)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(db_err)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(parse_uuid(&row.map_err(db_err)?)?);
    }
    Ok(out)
}

fn write_character_labels(conn: &Connection, character: &Character) -> Result<()> {
    let id = character.id.to_string();
    for alias in &character.aliases {
        conn.execute(
            "INSERT OR IGNORE INTO character_aliases (character_id, alias_key) VALUES (?1, ?2)",
            params![id, label_key(alias)],
        )
        .map_err(db_err)?;
    }
    for tag in &character.tags {
        conn.execute(
            "INSERT OR IGNORE INTO character_tags (character_id, tag_key) VALUES (?1, ?2)",
            params![id, label_key(tag)],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn write_fact_tags(conn: &Connection, fact: &Fact) -> Result<()> {
    let id = fact.id.to_string();
    for tag in &fact.tags {
        conn.execute(
            "INSERT OR IGNORE INTO fact_tags (fact_id, tag_key) VALUES (?1, ?2)",
            params![id, label_key(tag)],
        )
        .map_err(db_err)?;
    }
    Ok(())
}

fn character_lexical_score(pattern: &str, c: &Character) -> f64 {
    std::iter::once(c.name.as_str())
        .chain(c.aliases.iter().map(String::as_str))
        .chain(std::iter::once(c.description.as_str()))
        .filter(|field| !field.is_empty())
        .map(|field| trigram_similarity(pattern, field))
        .fold(0.0, f64::max)
}

fn row_to_character(row: &Row<'_>) -> Result<Character> {
    let id: String = row.get(0).map_err(db_err)?;
    let aliases: String = row.get(2).map_err(db_err)?;
    let tags: String = row.get(3).map_err(db_err)?;
    let embedding: Option<Vec<u8>> = row.get(5).map_err(db_err)?;
    Ok(Character {
        id: parse_uuid(&id)?,
        name: row.get(1).map_err(db_err)?,
        aliases: serde_json::from_str(&aliases)?,
        tags: serde_json::from_str(&tags)?,
        description: row.get(4).map_err(db_err)?,
        embedding: embedding.as_deref().map(decode_vector),
        created_at: from_millis(row.get(6).map_err(db_err)?),
        updated_at: from_millis(row.get(7).map_err(db_err)?),
    })
}

fn row_to_fact(row: &Row<'_>) -> Result<Fact> {
    let id: String = row.get(0).map_err(db_err)?;
    let character_id: String = row.get(1).map_err(db_err)?;
    let tags: String = row.get(5).map_err(db_err)?;
    let embedding: Option<Vec<u8>> = row.get(6).map_err(db_err)?;
    Ok(Fact {
        id: parse_uuid(&id)?,
        character_id: parse_uuid(&character_id)?,
        fact_type: row.get(2).map_err(db_err)?,
        content: row.get(3).map_err(db_err)?,
        source: row.get(4).map_err(db_err)?,
        tags: serde_json::from_str(&tags)?,
        embedding: embedding.as_deref().map(decode_vector),
        created_at: from_millis(row.get(7).map_err(db_err)?),
        updated_at: from_millis(row.get(8).map_err(db_err)?),
    })
}

fn row_to_relation(row: &Row<'_>) -> Result<Relation> {
    let id: String = row.get(0).map_err(db_err)?;
    let source_id: String = row.get(1).map_err(db_err)?;
    let target_id: String = row.get(2).map_err(db_err)?;
    let embedding: Option<Vec<u8>> = row.get(6).map_err(db_err)?;
    Ok(Relation {
        id: parse_uuid(&id)?,
        source_id: parse_uuid(&source_id)?,
        target_id: parse_uuid(&target_id)?,
        relation_type: row.get(3).map_err(db_err)?,
        description: row.get(4).map_err(db_err)?,
        strength: row.get(5).map_err(db_err)?,
        embedding: embedding.as_deref().map(decode_vector),
        created_at: from_millis(row.get(7).map_err(db_err)?),
        updated_at: from_millis(row.get(8).map_err(db_err)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIM: usize = 4;

    async fn open_store() -> KnowledgeStore {
        let db = Arc::new(Database::in_memory().unwrap());
        KnowledgeStore::open(db, DIM, &StorageConfig::default())
            .await
            .unwrap()
    }

    fn character(name: &str, tags: &[&str]) -> Character {
        Character::new(
            name,
            vec![],
            "",
            tags.iter().map(|t| t.to_string()).collect(),
        )
        .unwrap()
    }

    fn fact(owner: Uuid, fact_type: &str, content: &str, tags: &[&str]) -> Fact {
        Fact::new(
            owner,
            fact_type,
            content,
            None,
            tags.iter().map(|t| t.to_string()).collect(),
        )
        .unwrap()
    }

    fn with_vector<T>(mut entity: T, set: impl FnOnce(&mut T, Vec<f32>), v: [f32; DIM]) -> T {
        set(&mut entity, v.to_vec());
        entity
    }

    #[tokio::test]
    async fn test_character_roundtrip() {
        let store = open_store().await;
        let mut c = Character::new(
            "李青",
            vec!["Li Qing".into()],
            "出身青帮",
            vec!["冷静".into()],
        )
        .unwrap();
        c.embedding = Some(vec![1.0, 0.0, 0.0, 0.0]);
        store.create_character(&c).await.unwrap();

        let loaded = store.get_character(c.id).await.unwrap();
        assert_eq!(loaded.name, "李青");
        assert_eq!(loaded.aliases, vec!["Li Qing"]);
        assert_eq!(loaded.embedding.as_deref(), Some(&[1.0, 0.0, 0.0, 0.0][..]));
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            c.created_at.timestamp_millis()
        );

        let by_alias = store.find_characters_by_name("li qing").await.unwrap();
        assert_eq!(by_alias.len(), 1);
        assert_eq!(by_alias[0].id, c.id);
    }

    #[tokio::test]
    async fn test_get_missing_character_is_not_found() {
        let store = open_store().await;
        let err = store.get_character(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, LoreError::NotFound { entity: "character", .. }));
    }

    #[tokio::test]
    async fn test_wrong_dimension_rejected_on_write() {
        let store = open_store().await;
        let mut c = character("Ann", &[]);
        c.embedding = Some(vec![1.0, 0.0]);
        let err = store.create_character(&c).await.unwrap_err();
        assert!(matches!(
            err,
            LoreError::DimensionMismatch {
                expected: 4,
                actual: 2,
                ..
            }
        ));
        assert!(store.find_character(c.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_fact_requires_owner() {
        let store = open_store().await;
        let f = fact(Uuid::new_v4(), "skill", "Archery", &[]);
        let err = store.add_fact(&f).await.unwrap_err();
        assert!(matches!(err, LoreError::NotFound { entity: "character", .. }));
    }

    #[tokio::test]
    async fn test_relation_rules() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        let b = character("Bo", &[]);
        store.create_character(&a).await.unwrap();
        store.create_character(&b).await.unwrap();

        let r = Relation::new(a.id, b.id, "mentor", "taught her the bow", Some(0.9)).unwrap();
        store.create_relation(&r).await.unwrap();

        let dup = Relation::new(a.id, b.id, "mentor", "", None).unwrap();
        let err = store.create_relation(&dup).await.unwrap_err();
        assert!(matches!(err, LoreError::Validation(_)));

        let missing = Relation::new(a.id, Uuid::new_v4(), "rival", "", None).unwrap();
        let err = store.create_relation(&missing).await.unwrap_err();
        assert!(matches!(err, LoreError::NotFound { .. }));

        let reverse = Relation::new(b.id, a.id, "mentor", "", None).unwrap();
        store.create_relation(&reverse).await.unwrap();

        assert_eq!(store.relations_for(a.id).await.unwrap().len(), 2);
        assert_eq!(store.relations_among(&[a.id, b.id]).await.unwrap().len(), 2);
        assert!(store.relations_among(&[a.id]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_character_cascades() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        let b = character("Bo", &[]);
        store.create_character(&a).await.unwrap();
        store.create_character(&b).await.unwrap();
        let f = with_vector(
            fact(a.id, "skill", "Archery", &["bow"]),
            |f, v| f.embedding = Some(v),
            [1.0, 0.0, 0.0, 0.0],
        );
        store.add_fact(&f).await.unwrap();
        let r = Relation::new(b.id, a.id, "rival", "", None).unwrap();
        store.create_relation(&r).await.unwrap();

        let summary = store.delete_character(a.id).await.unwrap();
        assert_eq!(
            summary,
            DeleteSummary {
                facts_removed: 1,
                relations_removed: 1
            }
        );

        assert!(store.fact_vector(f.id).is_none());
        assert!(store.relations_for(b.id).await.unwrap().is_empty());
        let hits = store
            .find_facts_by_vector(&[1.0, 0.0, 0.0, 0.0], 5, &SearchFilters::default())
            .await
            .unwrap();
        assert!(hits.is_empty());
        let lexical = store
            .find_facts_by_lexical("Archery", &SearchFilters::default(), 0.0, 5)
            .await
            .unwrap();
        assert!(lexical.is_empty());

        let err = store.delete_character(a.id).await.unwrap_err();
        assert!(matches!(err, LoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_vector_search_respects_filters() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        let b = character("Bo", &[]);
        store.create_character(&a).await.unwrap();
        store.create_character(&b).await.unwrap();

        let fa = with_vector(
            fact(a.id, "personality", "calm under pressure", &[]),
            |f, v| f.embedding = Some(v),
            [1.0, 0.0, 0.0, 0.0],
        );
        let fb = with_vector(
            fact(b.id, "Personality", "calm and patient", &[]),
            |f, v| f.embedding = Some(v),
            [0.9, 0.1, 0.0, 0.0],
        );
        let fc = with_vector(
            fact(b.id, "skill", "swordsmanship", &[]),
            |f, v| f.embedding = Some(v),
            [0.0, 1.0, 0.0, 0.0],
        );
        for f in [&fa, &fb, &fc] {
            store.add_fact(f).await.unwrap();
        }

        let q = [1.0, 0.0, 0.0, 0.0];
        let all = store
            .find_facts_by_vector(&q, 3, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(all[0].entity.id, fa.id);
        assert!((all[0].similarity - 1.0).abs() < 1e-6);
        assert!(all[0].distance().abs() < 1e-6);

        let only_b = SearchFilters {
            character_ids: vec![b.id],
            ..Default::default()
        };
        let hits = store.find_facts_by_vector(&q, 3, &only_b).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.entity.character_id == b.id));

        let personality = SearchFilters {
            fact_types: vec!["PERSONALITY".into()],
            ..Default::default()
        };
        let hits = store.find_facts_by_vector(&q, 3, &personality).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.entity.id != fc.id));
    }

    #[tokio::test]
    async fn test_lexical_matches_cjk_and_short_patterns() {
        let store = open_store().await;
        let a = character("李青", &[]);
        store.create_character(&a).await.unwrap();
        let f = fact(a.id, "性格", "李青在面对危险时总是保持冷静", &[]);
        store.add_fact(&f).await.unwrap();

        let hits = store
            .find_facts_by_lexical("保持冷静", &SearchFilters::default(), 0.3, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score >= 0.3);

        // Two characters: below the trigram length, served by LIKE.
        let hits = store
            .find_facts_by_lexical("冷静", &SearchFilters::default(), 0.0, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let none = store
            .find_facts_by_lexical("swordsmanship", &SearchFilters::default(), 0.3, 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        let chars = store
            .find_characters_by_lexical("李青", &SearchFilters::default(), 0.0, 10)
            .await
            .unwrap();
        assert_eq!(chars.len(), 1);
    }

    #[tokio::test]
    async fn test_lexical_tolerates_fts_syntax() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        store.create_character(&a).await.unwrap();
        store
            .add_fact(&fact(a.id, "quote", "She said \"never\" AND meant it", &[]))
            .await
            .unwrap();

        let hits = store
            .find_facts_by_lexical("\"never\" AND", &SearchFilters::default(), 0.3, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_tag_queries_any_and_all() {
        let store = open_store().await;
        let a = character("Ann", &["Brave", "loyal"]);
        let b = character("Bo", &["brave"]);
        store.create_character(&a).await.unwrap();
        store.create_character(&b).await.unwrap();
        store
            .add_fact(&fact(a.id, "skill", "Archery", &["Combat", "bow"]))
            .await
            .unwrap();
        store
            .add_fact(&fact(b.id, "skill", "Fencing", &["combat"]))
            .await
            .unwrap();

        let tags = vec!["BRAVE".to_string(), "Loyal".to_string()];
        let any = store
            .find_characters_by_tags(&tags, TagMatchMode::Any, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(any.len(), 2);
        let all = store
            .find_characters_by_tags(&tags, TagMatchMode::All, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, a.id);

        let combat = vec!["#combat".to_string()];
        let facts = store
            .find_facts_by_tags(&combat, TagMatchMode::Any, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(facts.len(), 2);
    }

    #[tokio::test]
    async fn test_embedding_backlog_and_set_embedding() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        store.create_character(&a).await.unwrap();
        let f = fact(a.id, "skill", "Archery", &[]);
        store.add_fact(&f).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.facts, 1);
        assert_eq!(stats.pending_embeddings, 2);

        let pending = store.pending_embeddings(EntityKind::Fact, 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].text, "Archery");

        store
            .set_embedding(EntityKind::Fact, f.id, &[0.0, 0.0, 1.0, 0.0])
            .await
            .unwrap();
        assert!(store
            .embedding_backlog(EntityKind::Fact, BacklogScope::Pending, 0, 10)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .embedding_backlog(EntityKind::Fact, BacklogScope::All, 0, 10)
                .await
                .unwrap()
                .len(),
            1
        );

        let hits = store
            .find_facts_by_vector(&[0.0, 0.0, 1.0, 0.0], 1, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits[0].entity.id, f.id);

        let err = store
            .set_embedding(EntityKind::Fact, Uuid::new_v4(), &[0.0; DIM])
            .await
            .unwrap_err();
        assert!(matches!(err, LoreError::NotFound { entity: "fact", .. }));
    }

    #[tokio::test]
    async fn test_mismatched_vectors_skipped_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lore.db");
        let config = StorageConfig::default();

        let f_id;
        {
            let db = Arc::new(Database::open(&path, &config).unwrap());
            let store = KnowledgeStore::open(db, DIM, &config).await.unwrap();
            let a = character("Ann", &[]);
            store.create_character(&a).await.unwrap();
            let f = with_vector(
                fact(a.id, "skill", "Archery", &[]),
                |f, v| f.embedding = Some(v),
                [1.0, 0.0, 0.0, 0.0],
            );
            store.add_fact(&f).await.unwrap();
            f_id = f.id;
        }

        let db = Arc::new(Database::open(&path, &config).unwrap());
        let store = KnowledgeStore::open(db, 8, &config).await.unwrap();
        assert!(store.fact_vector(f_id).is_none());

        let err = store.get_fact(f_id).await.unwrap_err();
        assert!(matches!(err, LoreError::DimensionMismatch { expected: 8, actual: 4, .. }));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.dimension_mismatches, 1);
        let pending = store
            .embedding_backlog(EntityKind::Fact, BacklogScope::Pending, 0, 10)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_reports_resource_exhausted() {
        let store = open_store().await;
        let _held = store.database().acquire().await.unwrap();
        let impatient = store.with_acquire_timeout(Duration::from_millis(10));
        let err = impatient.list_characters(10, 0).await.unwrap_err();
        assert!(matches!(err, LoreError::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn test_update_fact_reindexes_tags() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        store.create_character(&a).await.unwrap();
        let mut f = fact(a.id, "skill", "Archery", &["bow"]);
        store.add_fact(&f).await.unwrap();

        f.tags = vec!["ranged".into()];
        let updated = store.update_fact(&f).await.unwrap();
        assert!(updated.updated_at >= f.updated_at);

        let bow = store
            .find_facts_by_tags(&["bow".into()], TagMatchMode::Any, &SearchFilters::default())
            .await
            .unwrap();
        assert!(bow.is_empty());
        let ranged = store
            .find_facts_by_tags(&["ranged".into()], TagMatchMode::Any, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
    }

    #[tokio::test]
    async fn test_update_character_rewrites_aliases() {
        let store = open_store().await;
        let mut c = character("Ann", &["calm"]);
        store.create_character(&c).await.unwrap();

        c.aliases = vec!["Annie".into()];
        c.description = "A patient archer".into();
        store.update_character(&c).await.unwrap();

        let loaded = store.get_character(c.id).await.unwrap();
        assert_eq!(loaded.description, "A patient archer");
        let by_alias = store.find_characters_by_name("annie").await.unwrap();
        assert_eq!(by_alias.len(), 1);

        let ghost = character("Ghost", &[]);
        let err = store.update_character(&ghost).await.unwrap_err();
        assert!(matches!(err, LoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_fact_and_relation() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        let b = character("Bo", &[]);
        store.create_character(&a).await.unwrap();
        store.create_character(&b).await.unwrap();
        let f = with_vector(
            fact(a.id, "skill", "Archery", &[]),
            |f, v| f.embedding = Some(v),
            [1.0, 0.0, 0.0, 0.0],
        );
        store.add_fact(&f).await.unwrap();
        let r = with_vector(
            Relation::new(a.id, b.id, "mentor", "taught her the bow", None).unwrap(),
            |r, v| r.embedding = Some(v),
            [0.0, 1.0, 0.0, 0.0],
        );
        store.create_relation(&r).await.unwrap();

        let near = store.find_relations_by_vector(&[0.0, 1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(near.len(), 1);
        assert_eq!(near[0].entity.id, r.id);

        store.delete_fact(f.id).await.unwrap();
        assert!(store.fact_vector(f.id).is_none());
        assert!(matches!(
            store.get_fact(f.id).await.unwrap_err(),
            LoreError::NotFound { .. }
        ));

        store.delete_relation(r.id).await.unwrap();
        assert!(store
            .find_relations_by_vector(&[0.0, 1.0, 0.0, 0.0], 5)
            .await
            .unwrap()
            .is_empty());
        assert!(matches!(
            store.delete_relation(r.id).await.unwrap_err(),
            LoreError::NotFound { .. }
        ));

        // Owners survive.
        assert!(store.get_character(a.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_lexical_filters_apply_before_candidate_cap() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        let b = character("Bo", &[]);
        store.create_character(&a).await.unwrap();
        store.create_character(&b).await.unwrap();

        let target = fact(b.id, "性格", "他在那场持续了三天三夜的激烈战斗中始终保持冷静", &[]);
        store.add_fact(&target).await.unwrap();
        for i in 0..(LEXICAL_CANDIDATE_LIMIT + 100) {
            let f = fact(a.id, "技能", &format!("保持冷静 {}", i), &[]);
            store.add_fact(&f).await.unwrap();
        }

        let by_owner = SearchFilters {
            character_ids: vec![b.id],
            ..Default::default()
        };
        let hits = store
            .find_facts_by_lexical("保持冷静", &by_owner, 0.3, 40)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.id, target.id);

        let by_type = SearchFilters {
            fact_types: vec!["性格".into()],
            ..Default::default()
        };
        let hits = store
            .find_facts_by_lexical("保持冷静", &by_type, 0.3, 40)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity.id, target.id);

        let chars = store
            .find_characters_by_lexical("Bo", &by_type, 0.0, 10)
            .await
            .unwrap();
        assert_eq!(chars.len(), 1);
        assert_eq!(chars[0].entity.id, b.id);
    }

    #[tokio::test]
    async fn test_index_updates_follow_commit_order() {
        let store = open_store().await;
        let a = character("Ann", &[]);
        store.create_character(&a).await.unwrap();
        let original = with_vector(
            fact(a.id, "skill", "Archery", &[]),
            |f, v| f.embedding = Some(v),
            [1.0, 0.0, 0.0, 0.0],
        );
        store.add_fact(&original).await.unwrap();
        let added_at = store.write_version.load(Ordering::SeqCst);

        let mut moved = original.clone();
        moved.embedding = Some(vec![0.0, 0.0, 1.0, 0.0]);
        store.update_fact(&moved).await.unwrap();
        assert!(store.write_version.load(Ordering::SeqCst) > added_at);

        // The add's index update arriving after the update's must lose.
        store.index_fact(&original, added_at).unwrap();
        let v = store.fact_vector(original.id).unwrap();
        assert!((v[2] - 1.0).abs() < 1e-6);

        store.delete_fact(original.id).await.unwrap();
        store.index_fact(&moved, added_at + 1).unwrap();
        assert!(store.fact_vector(original.id).is_none());
    }

    #[tokio::test]
    async fn test_fact_index_trains_off_the_write_path() {
        let config = StorageConfig {
            ivf_min_vectors: 16,
            ivf_lists: 4,
            ..StorageConfig::default()
        };
        let db = Arc::new(Database::in_memory().unwrap());
        let store = KnowledgeStore::open(db.clone(), DIM, &config).await.unwrap();
        let a = character("Ann", &[]);
        store.create_character(&a).await.unwrap();
        for i in 0..24 {
            let x = i as f32;
            let f = with_vector(
                fact(a.id, "skill", &format!("Skill {}", i), &[]),
                |f, v| f.embedding = Some(v),
                [1.0 + x, x % 3.0, x % 5.0, 0.5],
            );
            store.add_fact(&f).await.unwrap();
        }

        let mut trained = false;
        for _ in 0..200 {
            if matches!(store.fact_index_mode(), IndexMode::Ivf { .. }) {
                trained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(trained, "background training never finished");

        // Reopening trains before returning.
        let reopened = KnowledgeStore::open(db, DIM, &config).await.unwrap();
        assert_eq!(reopened.fact_index_mode(), IndexMode::Ivf { lists: 4 });
        let hits = reopened
            .find_facts_by_vector(&[1.0, 0.0, 0.0, 0.5], 24, &SearchFilters::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 24);
    }
}
