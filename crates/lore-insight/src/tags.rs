//! Tag generation for characters.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use lore_core::config::TagConfig;
use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result};
use lore_core::text::{clean_label, label_key, truncate_chars};
use lore_core::types::{Character, Fact};
use lore_vector::{CompletionRequest, ProviderClient};

use crate::parse::{num_field, parse_array, str_field, unit_interval};

/// Longest tag kept, in characters.
pub const MAX_TAG_CHARS: usize = 50;

/// Budget for the description and facts placed in the prompt.
const MAX_CONTEXT_CHARS: usize = 6_000;

/// Facts included when tagging a stored character.
const MAX_CONTEXT_FACTS: usize = 20;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that generates character tags for \
     creative writing. Return only valid JSON.";

/// A tag with the provider's confidence in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedTag {
    pub tag: String,
    pub confidence: f64,
}

/// Derives tags from character text through the model provider.
pub struct TagGenerator {
    client: Arc<ProviderClient>,
    config: TagConfig,
}

impl TagGenerator {
    pub fn new(client: Arc<ProviderClient>, config: TagConfig) -> Self {
        Self { client, config }
    }

    /// Tags for a free-text description.
    pub async fn generate(&self, description: &str, deadline: Deadline) -> Result<Vec<GeneratedTag>> {
        if description.trim().is_empty() {
            return Err(LoreError::validation("description must not be empty"));
        }
        let context = format!(
            "Description: {}",
            truncate_chars(description.trim(), MAX_CONTEXT_CHARS)
        );
        self.run(&context, deadline).await
    }

    /// Tags for a stored character, using its description and facts.
    pub async fn generate_for_character(
        &self,
        character: &Character,
        facts: &[Fact],
        deadline: Deadline,
    ) -> Result<Vec<GeneratedTag>> {
        let mut context = format!("Character: {}", character.name);
        if !character.description.is_empty() {
            context.push_str("\nDescription: ");
            context.push_str(&character.description);
        }
        if !facts.is_empty() {
            context.push_str("\n\nFacts:");
            for fact in facts.iter().take(MAX_CONTEXT_FACTS) {
                context.push_str(&format!("\n- {}: {}", fact.fact_type, fact.content));
            }
        }
        let context = truncate_chars(&context, MAX_CONTEXT_CHARS).to_string();
        self.run(&context, deadline).await
    }

    async fn run(&self, context: &str, deadline: Deadline) -> Result<Vec<GeneratedTag>> {
        let prompt = format!(
            "Analyze the following character information and generate relevant tags that \
             describe their key attributes, personality traits, roles, and characteristics.\n\n\
             {}\n\n\
             Generate 5-{} concise tags in the language of the text. Return only a JSON array \
             of objects with \"tag\" and \"confidence\" (0.0 to 1.0).\n\n\
             Example format: [{{\"tag\": \"brave\", \"confidence\": 0.9}}, \
             {{\"tag\": \"loyal\", \"confidence\": 0.7}}]",
            context,
            self.config.max_tags.max(5)
        );
        let request = CompletionRequest::new(prompt)
            .with_system(SYSTEM_PROMPT)
            .with_temperature(0.7)
            .with_max_tokens(300);

        let raw = self.client.complete(&request, deadline).await?;
        let tags = self.parse(&raw)?;
        info!(count = tags.len(), "Tags generated");
        Ok(tags)
    }

    /// Turn a model response into clean, deduplicated tags, best first.
    ///
    /// Accepts an array of strings, an array of `{tag, confidence}` objects,
    /// or an object mapping tags to confidences.
    pub fn parse(&self, raw: &str) -> Result<Vec<GeneratedTag>> {
        let items = match parse_array(raw, &["tags"]) {
            Ok(items) => items,
            Err(e) => match crate::parse::parse_json(raw) {
                Ok(Value::Object(map)) => map
                    .into_iter()
                    .map(|(tag, conf)| serde_json::json!({"tag": tag, "confidence": conf}))
                    .collect(),
                _ => return Err(e),
            },
        };

        let mut order: Vec<String> = Vec::new();
        let mut best: HashMap<String, GeneratedTag> = HashMap::new();
        for item in &items {
            let (label, confidence) = match item {
                Value::String(s) => (s.as_str(), None),
                Value::Object(_) => match str_field(item, &["tag", "name", "label"]) {
                    Some(label) => (label, num_field(item, &["confidence", "score"])),
                    None => continue,
                },
                _ => continue,
            };
            let tag = clean_label(label);
            if tag.is_empty() || tag.chars().count() > MAX_TAG_CHARS {
                debug!(tag = %label, "Dropping unusable tag");
                continue;
            }
            let confidence = confidence
                .and_then(unit_interval)
                .unwrap_or(self.config.default_confidence);
            let key = label_key(&tag);
            match best.get_mut(&key) {
                Some(existing) => existing.confidence = existing.confidence.max(confidence),
                None => {
                    order.push(key.clone());
                    best.insert(key, GeneratedTag { tag, confidence });
                }
            }
        }

        let mut tags: Vec<GeneratedTag> = order.iter().filter_map(|k| best.remove(k)).collect();
        tags.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        tags.truncate(self.config.max_tags);
        Ok(tags)
    }
}
