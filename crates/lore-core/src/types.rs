use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LoreError, Result};
use crate::text::{dedup_labels, label_key, normalize};

// =============================================================================
// Enums
// =============================================================================

/// The kind of entity a vector or search hit belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Character,
    Fact,
    Relation,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Fact => "fact",
            EntityKind::Relation => "relation",
        }
    }
}

/// How a tag query combines its tags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagMatchMode {
    /// Entity carries at least one of the tags.
    #[default]
    Any,
    /// Entity carries every tag.
    All,
}

/// Whether an entity's text has a vector attached yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    /// Vector computed and stored.
    Ready,
    /// Provider was unavailable; the entity awaits a backfill pass.
    Pending,
    /// Entity has no text worth embedding.
    NotApplicable,
}

// =============================================================================
// Entities
// =============================================================================

/// A fictional character.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    pub aliases: Vec<String>,
    pub tags: Vec<String>,
    pub description: String,
    /// Profile vector over name, aliases and description.
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Character {
    /// Create a character with normalized name and deduplicated alias/tag sets.
    pub fn new(
        name: &str,
        aliases: Vec<String>,
        description: &str,
        tags: Vec<String>,
    ) -> Result<Self> {
        let now = Utc::now();
        let character = Self {
            id: Uuid::new_v4(),
            name: normalize(name),
            aliases: dedup_labels(aliases),
            tags: dedup_labels(tags),
            description: description.trim().to_string(),
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        character.validate()?;
        Ok(character)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(LoreError::validation("character name must not be empty"));
        }
        Ok(())
    }

    /// Text embedded as the character's profile vector.
    pub fn profile_text(&self) -> String {
        let mut text = self.name.clone();
        if !self.aliases.is_empty() {
            text.push_str(" (");
            text.push_str(&self.aliases.join(", "));
            text.push(')');
        }
        if !self.description.is_empty() {
            text.push_str(": ");
            text.push_str(&self.description);
        }
        text
    }
}

/// A piece of knowledge owned by exactly one character.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: Uuid,
    pub character_id: Uuid,
    /// Open label such as personality, identity, background or skill.
    pub fact_type: String,
    pub content: String,
    pub source: Option<String>,
    pub tags: Vec<String>,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fact {
    pub fn new(
        character_id: Uuid,
        fact_type: &str,
        content: &str,
        source: Option<String>,
        tags: Vec<String>,
    ) -> Result<Self> {
        let now = Utc::now();
        let fact = Self {
            id: Uuid::new_v4(),
            character_id,
            fact_type: normalize(fact_type),
            content: content.trim().to_string(),
            source: source
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            tags: dedup_labels(tags),
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        fact.validate()?;
        Ok(fact)
    }

    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            return Err(LoreError::validation("fact content must not be empty"));
        }
        if self.fact_type.trim().is_empty() {
            return Err(LoreError::validation("fact type must not be empty"));
        }
        Ok(())
    }
}

/// A directed edge between two distinct characters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation_type: String,
    pub description: String,
    /// How strong or important the relationship is, in [0, 1].
    pub strength: f64,
    #[serde(skip)]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Relation {
    pub const DEFAULT_STRENGTH: f64 = 0.5;

    pub fn new(
        source_id: Uuid,
        target_id: Uuid,
        relation_type: &str,
        description: &str,
        strength: Option<f64>,
    ) -> Result<Self> {
        let now = Utc::now();
        let relation = Self {
            id: Uuid::new_v4(),
            source_id,
            target_id,
            relation_type: normalize(relation_type),
            description: description.trim().to_string(),
            strength: strength.unwrap_or(Self::DEFAULT_STRENGTH),
            embedding: None,
            created_at: now,
            updated_at: now,
        };
        relation.validate()?;
        Ok(relation)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_id == self.target_id {
            return Err(LoreError::validation(
                "a character cannot have a relation with itself",
            ));
        }
        if self.relation_type.trim().is_empty() {
            return Err(LoreError::validation("relation type must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.strength) {
            return Err(LoreError::validation(format!(
                "relation strength must be within [0, 1], got {}",
                self.strength
            )));
        }
        Ok(())
    }

    /// The endpoint opposite `character_id`, if the relation touches it.
    pub fn other_end(&self, character_id: Uuid) -> Option<Uuid> {
        if self.source_id == character_id {
            Some(self.target_id)
        } else if self.target_id == character_id {
            Some(self.source_id)
        } else {
            None
        }
    }
}

// =============================================================================
// Query types
// =============================================================================

/// Hard filters applied to search candidates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchFilters {
    /// Tags contributing candidates and the tag-overlap score.
    pub tags: Vec<String>,
    /// Restrict facts to these types (characters: having a fact of these types).
    pub fact_types: Vec<String>,
    /// Restrict results to these owning characters.
    pub character_ids: Vec<Uuid>,
}

impl SearchFilters {
    /// True if `fact` passes the fact-type and character restrictions.
    pub fn admits_fact(&self, fact: &Fact) -> bool {
        let type_ok = self.fact_types.is_empty() || {
            let key = label_key(&fact.fact_type);
            self.fact_types.iter().any(|t| label_key(t) == key)
        };
        let owner_ok =
            self.character_ids.is_empty() || self.character_ids.contains(&fact.character_id);
        type_ok && owner_ok
    }

    /// True if the character id passes the character restriction.
    pub fn admits_character(&self, character_id: Uuid) -> bool {
        self.character_ids.is_empty() || self.character_ids.contains(&character_id)
    }
}

/// Aggregate counts reported by the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub characters: u64,
    pub facts: u64,
    pub relations: u64,
    /// Entities with text but no vector yet.
    pub pending_embeddings: u64,
    /// Stored vectors whose length differs from the configured dimension.
    pub dimension_mismatches: u64,
    /// "brute_force" or "ivf", for the fact index.
    pub fact_index_mode: String,
}
