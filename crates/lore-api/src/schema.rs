//! Tool argument types and their validation.
//!
//! Every payload is decoded with unknown fields rejected, then checked
//! against length and range limits before any component sees it.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use lore_core::error::{LoreError, Result};
use lore_core::text::normalize;
use lore_core::types::TagMatchMode;
use lore_vector::MAX_QUERY_CHARS;

pub const MAX_NAME_CHARS: usize = 255;
pub const MAX_ALIASES: usize = 20;
pub const MAX_DESCRIPTION_CHARS: usize = 10_000;
pub const MAX_TAGS: usize = 50;
pub const MAX_TAG_CHARS: usize = 50;
pub const MAX_FACT_TYPE_CHARS: usize = 100;
pub const MAX_CONTENT_CHARS: usize = 10_000;
pub const MAX_SOURCE_CHARS: usize = 500;
pub const MAX_RELATION_TYPE_CHARS: usize = 100;
pub const MAX_RELATION_DESCRIPTION_CHARS: usize = 2_000;
pub const MAX_CONTEXT_CHARS: usize = 10_000;
pub const MAX_CHARACTER_IDS: usize = 100;

/// Decode tool arguments, turning any shape error into a validation error.
pub fn decode<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args
    };
    serde_json::from_value(args)
        .map_err(|e| LoreError::validation(format!("invalid arguments for {}: {}", tool, e)))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCharacterArgs {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl CreateCharacterArgs {
    pub fn validate(&self) -> Result<()> {
        text_len("name", &self.name, 1, MAX_NAME_CHARS)?;
        if self.aliases.len() > MAX_ALIASES {
            return Err(LoreError::validation(format!(
                "at most {} aliases are allowed, got {}",
                MAX_ALIASES,
                self.aliases.len()
            )));
        }
        for alias in &self.aliases {
            text_len("alias", alias, 1, MAX_NAME_CHARS)?;
        }
        text_len("description", &self.description, 0, MAX_DESCRIPTION_CHARS)?;
        tag_list(&self.tags)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CharacterFilterArgs {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub fact_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchCharactersArgs {
    pub query: String,
    #[serde(default)]
    pub filters: CharacterFilterArgs,
    #[serde(default)]
    pub tag_mode: TagMatchMode,
    pub similarity_threshold: Option<f64>,
    pub limit: Option<usize>,
}

impl SearchCharactersArgs {
    pub fn validate(&self) -> Result<()> {
        query_text(&self.query)?;
        tag_list(&self.filters.tags)?;
        fact_type_list(&self.filters.fact_types)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddFactArgs {
    pub character_id: Uuid,
    pub fact_type: String,
    pub content: String,
    pub source: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl AddFactArgs {
    pub fn validate(&self) -> Result<()> {
        text_len("fact_type", &self.fact_type, 1, MAX_FACT_TYPE_CHARS)?;
        text_len("content", &self.content, 1, MAX_CONTENT_CHARS)?;
        if let Some(source) = &self.source {
            text_len("source", source, 0, MAX_SOURCE_CHARS)?;
        }
        tag_list(&self.tags)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchFactsArgs {
    pub query: String,
    #[serde(default)]
    pub character_names: Vec<String>,
    #[serde(default)]
    pub character_ids: Vec<Uuid>,
    #[serde(default)]
    pub fact_types: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag_mode: TagMatchMode,
    pub similarity_threshold: Option<f64>,
    pub limit: Option<usize>,
}

impl SearchFactsArgs {
    pub fn validate(&self) -> Result<()> {
        query_text(&self.query)?;
        for name in &self.character_names {
            text_len("character name", name, 1, MAX_NAME_CHARS)?;
        }
        if !self.character_ids.is_empty() {
            id_list(&self.character_ids, 1)?;
        }
        tag_list(&self.tags)?;
        fact_type_list(&self.fact_types)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerateTagsArgs {
    pub description: Option<String>,
    pub character_id: Option<Uuid>,
}

impl GenerateTagsArgs {
    pub fn validate(&self) -> Result<()> {
        match (&self.description, &self.character_id) {
            (Some(description), None) => text_len("description", description, 1, MAX_DESCRIPTION_CHARS),
            (None, Some(_)) => Ok(()),
            _ => Err(LoreError::validation(
                "exactly one of description or character_id is required",
            )),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalyzeRelationshipsArgs {
    pub character_ids: Vec<Uuid>,
    pub context: Option<String>,
}

impl AnalyzeRelationshipsArgs {
    pub fn validate(&self) -> Result<()> {
        id_list(&self.character_ids, 2)?;
        if let Some(context) = &self.context {
            text_len("context", context, 0, MAX_CONTEXT_CHARS)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CharacterIdArgs {
    pub character_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CharacterIdsArgs {
    pub character_ids: Vec<Uuid>,
}

impl CharacterIdsArgs {
    pub fn validate(&self) -> Result<()> {
        id_list(&self.character_ids, 1)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRelationshipArgs {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation_type: String,
    #[serde(default)]
    pub description: String,
    pub strength: Option<f64>,
}

impl CreateRelationshipArgs {
    pub fn validate(&self) -> Result<()> {
        if self.source_id == self.target_id {
            return Err(LoreError::validation(
                "a character cannot have a relation with itself",
            ));
        }
        text_len("relation_type", &self.relation_type, 1, MAX_RELATION_TYPE_CHARS)?;
        text_len("description", &self.description, 0, MAX_RELATION_DESCRIPTION_CHARS)?;
        if let Some(strength) = self.strength {
            if strength.is_nan() || !(0.0..=1.0).contains(&strength) {
                return Err(LoreError::validation(format!(
                    "strength must be within [0, 1], got {}",
                    strength
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SuggestDevelopmentArgs {
    pub character_id: Uuid,
    pub context: Option<String>,
}

impl SuggestDevelopmentArgs {
    pub fn validate(&self) -> Result<()> {
        if let Some(context) = &self.context {
            text_len("context", context, 0, MAX_CONTEXT_CHARS)?;
        }
        Ok(())
    }
}

fn text_len(field: &str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.trim().chars().count();
    if len < min {
        return Err(LoreError::validation(format!("{} must not be empty", field)));
    }
    if len > max {
        return Err(LoreError::validation(format!(
            "{} must be at most {} characters, got {}",
            field, max, len
        )));
    }
    Ok(())
}

fn query_text(query: &str) -> Result<()> {
    text_len("query", &normalize(query), 1, MAX_QUERY_CHARS)
}

fn tag_list(tags: &[String]) -> Result<()> {
    if tags.len() > MAX_TAGS {
        return Err(LoreError::validation(format!(
            "at most {} tags are allowed, got {}",
            MAX_TAGS,
            tags.len()
        )));
    }
    for tag in tags {
        text_len("tag", tag, 1, MAX_TAG_CHARS)?;
    }
    Ok(())
}

fn fact_type_list(fact_types: &[String]) -> Result<()> {
    for fact_type in fact_types {
        text_len("fact_type", fact_type, 1, MAX_FACT_TYPE_CHARS)?;
    }
    Ok(())
}

fn id_list(ids: &[Uuid], min: usize) -> Result<()> {
    if ids.len() < min {
        return Err(LoreError::validation(format!(
            "at least {} character id(s) required, got {}",
            min,
            ids.len()
        )));
    }
    if ids.len() > MAX_CHARACTER_IDS {
        return Err(LoreError::validation(format!(
            "at most {} character ids are allowed, got {}",
            MAX_CHARACTER_IDS,
            ids.len()
        )));
    }
    let unique: HashSet<&Uuid> = ids.iter().collect();
    if unique.len() != ids.len() {
        return Err(LoreError::validation("character_ids must not contain duplicates"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = decode::<CreateCharacterArgs>("create_character", json!({"name": "李青", "age": 30}))
            .unwrap_err();
        assert!(matches!(err, LoreError::Validation(_)));
        assert!(err.to_string().contains("age"));
    }

    #[test]
    fn test_missing_required_field() {
        let err = decode::<AddFactArgs>("add_character_fact", json!({"content": "x"})).unwrap_err();
        assert!(matches!(err, LoreError::Validation(_)));
    }

    #[test]
    fn test_character_limits() {
        let ok: CreateCharacterArgs = decode("t", json!({"name": "李青", "aliases": ["小李"]})).unwrap();
        ok.validate().unwrap();

        let blank: CreateCharacterArgs = decode("t", json!({"name": "   "})).unwrap();
        assert!(blank.validate().is_err());

        let long: CreateCharacterArgs = decode("t", json!({"name": "名".repeat(256)})).unwrap();
        assert!(long.validate().is_err());

        let aliases: Vec<String> = (0..21).map(|i| format!("a{}", i)).collect();
        let many: CreateCharacterArgs = decode("t", json!({"name": "x", "aliases": aliases})).unwrap();
        assert!(many.validate().is_err());

        let tag: CreateCharacterArgs = decode("t", json!({"name": "x", "tags": ["t".repeat(51)]})).unwrap();
        assert!(tag.validate().is_err());
    }

    #[test]
    fn test_generate_tags_needs_exactly_one_source() {
        let none: GenerateTagsArgs = decode("t", json!({})).unwrap();
        assert!(none.validate().is_err());
        let both: GenerateTagsArgs = decode(
            "t",
            json!({"description": "x", "character_id": Uuid::new_v4()}),
        )
        .unwrap();
        assert!(both.validate().is_err());
        let one: GenerateTagsArgs = decode("t", json!({"description": "冷静"})).unwrap();
        one.validate().unwrap();
    }

    #[test]
    fn test_id_lists() {
        let id = Uuid::new_v4();
        let dup: AnalyzeRelationshipsArgs = decode("t", json!({"character_ids": [id, id]})).unwrap();
        assert!(dup.validate().is_err());
        let single: AnalyzeRelationshipsArgs = decode("t", json!({"character_ids": [id]})).unwrap();
        assert!(single.validate().is_err());
        let empty: CharacterIdsArgs = decode("t", json!({"character_ids": []})).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_relationship_rules() {
        let id = Uuid::new_v4();
        let selfish: CreateRelationshipArgs = decode(
            "t",
            json!({"source_id": id, "target_id": id, "relation_type": "friend"}),
        )
        .unwrap();
        assert!(selfish.validate().is_err());
        let strong: CreateRelationshipArgs = decode(
            "t",
            json!({"source_id": id, "target_id": Uuid::new_v4(), "relation_type": "friend", "strength": 1.5}),
        )
        .unwrap();
        assert!(strong.validate().is_err());
    }

    #[test]
    fn test_tag_mode_is_snake_case() {
        let args: SearchFactsArgs = decode("t", json!({"query": "q", "tag_mode": "all"})).unwrap();
        assert_eq!(args.tag_mode, TagMatchMode::All);
    }
}
