//! Provider-written character summaries and development suggestions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use lore_core::config::RelationshipConfig;
use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result};
use lore_core::text::{normalize, truncate_chars};
use lore_core::types::Character;
use lore_storage::KnowledgeStore;
use lore_vector::{CompletionRequest, ProviderClient};

use crate::parse::parse_array;

/// Budget for the character context placed in either prompt.
const MAX_CONTEXT_CHARS: usize = 6_000;

/// Suggestions kept from one response.
pub const MAX_SUGGESTIONS: usize = 8;

/// Fewer suggestions than this are returned with a warning.
pub const MIN_SUGGESTIONS: usize = 5;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that creates character summaries for creative writing.";

const DEVELOPMENT_SYSTEM_PROMPT: &str = "You are a helpful assistant that provides character \
     development suggestions for creative writing. Return only valid JSON arrays.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSummary {
    pub character_id: Uuid,
    pub name: String,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DevelopmentSuggestions {
    pub character_id: Uuid,
    pub suggestions: Vec<String>,
    pub warnings: Vec<String>,
}

/// Builds prose about a stored character through the model provider.
pub struct CharacterProfiler {
    store: KnowledgeStore,
    client: Arc<ProviderClient>,
    config: RelationshipConfig,
}

impl CharacterProfiler {
    pub fn new(store: KnowledgeStore, client: Arc<ProviderClient>, config: RelationshipConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Summary over the description, tags, facts and relations of a character.
    pub async fn summarize(&self, character_id: Uuid, deadline: Deadline) -> Result<CharacterSummary> {
        let character = self.store.get_character(character_id).await?;
        let context = self.summary_context(&character).await?;
        let prompt = format!(
            "Create a comprehensive character summary based on the following information:\n\n\
             {}\n\n\
             Write a well-structured summary that captures the character's essence, key traits, \
             background, and relationships. The summary should be engaging and useful for \
             creative writing purposes.",
            context
        );
        let request = CompletionRequest::new(prompt)
            .with_system(SUMMARY_SYSTEM_PROMPT)
            .with_temperature(0.7)
            .with_max_tokens(500);

        let summary = self.client.complete(&request, deadline).await?.trim().to_string();
        if summary.is_empty() {
            return Err(LoreError::ProviderPermanent(
                "model returned an empty summary".to_string(),
            ));
        }
        info!(character_id = %character.id, chars = summary.chars().count(), "Character summary generated");
        Ok(CharacterSummary {
            character_id: character.id,
            name: character.name,
            summary,
        })
    }

    /// Development ideas for a character, optionally steered by story context.
    pub async fn suggest_development(
        &self,
        character_id: Uuid,
        context: Option<&str>,
        deadline: Deadline,
    ) -> Result<DevelopmentSuggestions> {
        let character = self.store.get_character(character_id).await?;
        let mut prompt = format!(
            "Suggest character development ideas for the following character:\n\n{}",
            truncate_chars(&base_context(&character), MAX_CONTEXT_CHARS)
        );
        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push_str("\n\nStory context: ");
            prompt.push_str(truncate_chars(context, 2_000));
        }
        prompt.push_str(&format!(
            "\n\nProvide {}-{} specific, actionable development suggestions that could help \
             deepen this character. Consider growth arcs, potential conflicts or challenges, \
             skill development, relationship dynamics and backstory elements to explore.\n\n\
             Return the suggestions as a JSON array of strings.\n\n\
             Example format: [\"Explore their fear of commitment through a romantic subplot\", \
             \"Develop their magical abilities through training with a mentor\"]",
            MIN_SUGGESTIONS, MAX_SUGGESTIONS
        ));
        let request = CompletionRequest::new(prompt)
            .with_system(DEVELOPMENT_SYSTEM_PROMPT)
            .with_temperature(0.8)
            .with_max_tokens(400);

        let raw = self.client.complete(&request, deadline).await?;
        let suggestions = parse_suggestions(&raw)?;

        let mut warnings = Vec::new();
        if suggestions.len() < MIN_SUGGESTIONS {
            warn!(
                character_id = %character.id,
                count = suggestions.len(),
                "Fewer development suggestions than requested"
            );
            warnings.push(format!(
                "model returned {} suggestion(s), expected at least {}",
                suggestions.len(),
                MIN_SUGGESTIONS
            ));
        }
        info!(character_id = %character.id, count = suggestions.len(), "Development suggestions generated");
        Ok(DevelopmentSuggestions {
            character_id: character.id,
            suggestions,
            warnings,
        })
    }

    async fn summary_context(&self, character: &Character) -> Result<String> {
        let mut context = base_context(character);

        let facts = self
            .store
            .facts_for(character.id, Some(self.config.max_facts_per_character))
            .await?;
        if !facts.is_empty() {
            context.push_str("\n\nFacts:");
            for fact in &facts {
                context.push_str(&format!("\n- {}: {}", fact.fact_type, fact.content));
            }
        }

        let relations = self.store.relations_for(character.id).await?;
        if !relations.is_empty() {
            context.push_str("\n\nRelationships:");
            for relation in &relations {
                let Some(other) = relation.other_end(character.id) else {
                    continue;
                };
                let other_name = match self.store.find_character(other).await? {
                    Some(c) => c.name,
                    None => continue,
                };
                context.push_str(&format!("\n- {} {}", relation.relation_type, other_name));
                if !relation.description.is_empty() {
                    context.push_str(&format!(": {}", relation.description));
                }
            }
        }
        Ok(truncate_chars(&context, MAX_CONTEXT_CHARS).to_string())
    }
}

fn base_context(character: &Character) -> String {
    let mut context = format!("Character: {}", character.name);
    if !character.aliases.is_empty() {
        context.push_str(&format!("\nAliases: {}", character.aliases.join(", ")));
    }
    if !character.description.is_empty() {
        context.push_str(&format!("\nDescription: {}", character.description));
    }
    if !character.tags.is_empty() {
        context.push_str(&format!("\nTags: {}", character.tags.join(", ")));
    }
    context
}

/// Strings from the response array, normalized, non-empty, unique, capped.
fn parse_suggestions(raw: &str) -> Result<Vec<String>> {
    let items = parse_array(raw, &["suggestions"])?;
    let mut out: Vec<String> = Vec::new();
    for item in items {
        let Value::String(s) = item else {
            continue;
        };
        let s = normalize(&s);
        if s.is_empty() || out.contains(&s) {
            continue;
        }
        out.push(s);
        if out.len() == MAX_SUGGESTIONS {
            break;
        }
    }
    Ok(out)
}
