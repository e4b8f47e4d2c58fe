//! Relationship inference between characters.
//!
//! Two independent passes over the same set of characters:
//!
//! - **Inference**: each character's facts (bounded per character) go into a
//!   reasoning prompt; the response is parsed into relation descriptors.
//! - **Indirect discovery**: breadth-first search over stored relations finds
//!   how requested characters connect through others, up to a depth bound.
//!
//! Nothing is written back to the store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use lore_core::config::RelationshipConfig;
use lore_core::deadline::Deadline;
use lore_core::error::{LoreError, Result};
use lore_core::text::{clean_label, label_key, truncate_chars};
use lore_core::types::{Character, Relation};
use lore_storage::KnowledgeStore;
use lore_vector::{CompletionRequest, ProviderClient};

use crate::parse::{num_field, parse_array, str_field, unit_interval};

/// Longest fact content quoted in the prompt.
const MAX_FACT_CHARS: usize = 300;

/// Confidence assigned when the provider reports none.
const DEFAULT_CONFIDENCE: f64 = 0.5;

const SYSTEM_PROMPT: &str = "You are a helpful assistant that analyzes character relationships \
     for creative writing. Return only valid JSON arrays.";

/// A relationship proposed by the provider. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredRelation {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub source_name: String,
    pub target_name: String,
    pub relation_type: String,
    pub description: String,
    pub confidence: f64,
}

/// One edge on an indirect path, oriented along the walk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathHop {
    pub relation_id: Uuid,
    pub from: Uuid,
    pub to: Uuid,
    pub relation_type: String,
}

/// A shortest connection of two or more hops between two requested characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndirectPath {
    pub from: Uuid,
    pub to: Uuid,
    pub hops: Vec<PathHop>,
}

impl IndirectPath {
    pub fn depth(&self) -> usize {
        self.hops.len()
    }
}

/// Everything `analyze` found.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RelationshipAnalysis {
    pub inferred: Vec<InferredRelation>,
    /// Stored relations with both ends in the requested set.
    pub existing: Vec<Relation>,
    pub indirect: Vec<IndirectPath>,
    pub warnings: Vec<String>,
}

pub struct RelationshipAnalyzer {
    store: KnowledgeStore,
    client: Arc<ProviderClient>,
    config: RelationshipConfig,
}

impl RelationshipAnalyzer {
    pub fn new(store: KnowledgeStore, client: Arc<ProviderClient>, config: RelationshipConfig) -> Self {
        Self {
            store,
            client,
            config,
        }
    }

    /// Infer relationships among `character_ids` and trace indirect links.
    pub async fn analyze(
        &self,
        character_ids: &[Uuid],
        context: Option<&str>,
        deadline: Deadline,
    ) -> Result<RelationshipAnalysis> {
        self.check_ids(character_ids)?;

        let mut characters = Vec::with_capacity(character_ids.len());
        for id in character_ids {
            characters.push(self.store.get_character(*id).await?);
        }
        let existing = self.store.relations_among(character_ids).await?;

        let prompt = self.compose_prompt(&characters, &existing, context).await?;

        let request = CompletionRequest::new(prompt)
            .with_system(SYSTEM_PROMPT)
            .with_temperature(0.7)
            .with_max_tokens(1_000);
        let raw = self.client.complete(&request, deadline).await?;

        let mut warnings = Vec::new();
        let inferred = parse_inferred(&raw, &characters, &mut warnings)?;
        let indirect = self.indirect_paths(character_ids, self.config.max_depth).await?;

        info!(
            characters = characters.len(),
            inferred = inferred.len(),
            existing = existing.len(),
            indirect = indirect.len(),
            "Relationship analysis completed"
        );
        Ok(RelationshipAnalysis {
            inferred,
            existing,
            indirect,
            warnings,
        })
    }

    /// Reasoning prompt over the characters, their bounded facts and the
    /// relations already stored between them.
    async fn compose_prompt(
        &self,
        characters: &[Character],
        existing: &[Relation],
        context: Option<&str>,
    ) -> Result<String> {
        let mut prompt = String::from(
            "Analyze the relationships between these characters and suggest potential new \
             relationships or refinements to existing ones.\n\nCharacters:\n",
        );
        for (i, c) in characters.iter().enumerate() {
            prompt.push_str(&format!("\n[C{}] {}", i + 1, c.name));
            if !c.aliases.is_empty() {
                prompt.push_str(&format!(" (aliases: {})", c.aliases.join(", ")));
            }
            if !c.description.is_empty() {
                prompt.push_str(&format!(" - {}", truncate_chars(&c.description, MAX_FACT_CHARS)));
            }
            let facts = self
                .store
                .facts_for(c.id, Some(self.config.max_facts_per_character))
                .await?;
            for fact in &facts {
                prompt.push_str(&format!(
                    "\n  - {}: {}",
                    fact.fact_type,
                    truncate_chars(&fact.content, MAX_FACT_CHARS)
                ));
            }
        }
        if !existing.is_empty() {
            prompt.push_str("\n\nExisting relationships:");
            for r in existing {
                let (Some(s), Some(t)) = (label_of(characters, r.source_id), label_of(characters, r.target_id)) else {
                    continue;
                };
                prompt.push_str(&format!("\n- {} -> {}: {}", s, t, r.relation_type));
                if !r.description.is_empty() {
                    prompt.push_str(&format!(" ({})", r.description));
                }
            }
        }
        if let Some(context) = context.map(str::trim).filter(|c| !c.is_empty()) {
            prompt.push_str("\n\nStory context: ");
            prompt.push_str(truncate_chars(context, 2_000));
        }
        prompt.push_str(
            "\n\nReturn a JSON array of objects with the fields \"source\" and \"target\" \
             (character labels such as \"C1\"), \"relation_type\" (e.g. friend, rival, mentor, \
             family), \"description\" and \"confidence\" (0.0 to 1.0). Only suggest relationships \
             supported by the information above.",
        );
        Ok(prompt)
    }

    /// Shortest paths of 2..=`max_depth` hops between pairs of `character_ids`.
    ///
    /// Relations are walked in both directions. Each search keeps a visited
    /// set, so cycles cost nothing extra, and the result is capped at
    /// `max_paths`.
    pub async fn indirect_paths(&self, character_ids: &[Uuid], max_depth: usize) -> Result<Vec<IndirectPath>> {
        let targets: HashMap<Uuid, usize> = character_ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i))
            .collect();
        let mut adjacency: HashMap<Uuid, Vec<Relation>> = HashMap::new();
        let mut paths = Vec::new();

        'starts: for (start_idx, start) in character_ids.iter().enumerate() {
            let mut visited: HashSet<Uuid> = HashSet::from([*start]);
            let mut queue: VecDeque<(Uuid, Vec<PathHop>)> = VecDeque::from([(*start, Vec::new())]);

            while let Some((node, hops)) = queue.pop_front() {
                if hops.len() >= max_depth {
                    continue;
                }
                if !adjacency.contains_key(&node) {
                    let edges = self.store.relations_for(node).await?;
                    adjacency.insert(node, edges);
                }
                let Some(edges) = adjacency.get(&node) else {
                    continue;
                };
                for edge in edges {
                    let Some(next) = edge.other_end(node) else {
                        continue;
                    };
                    if !visited.insert(next) {
                        continue;
                    }
                    let mut path = hops.clone();
                    path.push(PathHop {
                        relation_id: edge.id,
                        from: node,
                        to: next,
                        relation_type: edge.relation_type.clone(),
                    });
                    // Each pair is reported once, from the earlier requested id.
                    if let Some(&target_idx) = targets.get(&next) {
                        if target_idx > start_idx && path.len() >= 2 {
                            paths.push(IndirectPath {
                                from: *start,
                                to: next,
                                hops: path.clone(),
                            });
                            if paths.len() >= self.config.max_paths {
                                debug!(max_paths = self.config.max_paths, "Indirect path cap reached");
                                break 'starts;
                            }
                        }
                    }
                    queue.push_back((next, path));
                }
            }
        }
        Ok(paths)
    }

    fn check_ids(&self, character_ids: &[Uuid]) -> Result<()> {
        if character_ids.len() < 2 {
            return Err(LoreError::validation(
                "relationship analysis needs at least 2 characters",
            ));
        }
        if character_ids.len() > self.config.max_characters {
            return Err(LoreError::validation(format!(
                "at most {} characters can be analyzed at once, got {}",
                self.config.max_characters,
                character_ids.len()
            )));
        }
        let unique: HashSet<&Uuid> = character_ids.iter().collect();
        if unique.len() != character_ids.len() {
            return Err(LoreError::validation("character_ids must not contain duplicates"));
        }
        Ok(())
    }
}

fn label_of(characters: &[Character], id: Uuid) -> Option<String> {
    characters
        .iter()
        .position(|c| c.id == id)
        .map(|i| format!("C{}", i + 1))
}

/// Resolve a provider reference: a `C<n>` label, a UUID, or a name/alias.
fn resolve<'a>(reference: &str, characters: &'a [Character]) -> Option<&'a Character> {
    let reference = reference.trim().trim_start_matches('[').trim_end_matches(']');
    if let Some(n) = reference
        .strip_prefix('C')
        .or_else(|| reference.strip_prefix('c'))
        .and_then(|n| n.parse::<usize>().ok())
    {
        return n.checked_sub(1).and_then(|i| characters.get(i));
    }
    if let Ok(id) = Uuid::parse_str(reference) {
        return characters.iter().find(|c| c.id == id);
    }
    let key = label_key(reference);
    characters.iter().find(|c| {
        label_key(&c.name) == key || c.aliases.iter().any(|a| label_key(a) == key)
    })
}

fn reference(item: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match item.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(format!("C{}", n)),
        _ => None,
    })
}

fn parse_inferred(
    raw: &str,
    characters: &[Character],
    warnings: &mut Vec<String>,
) -> Result<Vec<InferredRelation>> {
    let items = parse_array(raw, &["relationships", "relations"])?;
    let mut out: Vec<InferredRelation> = Vec::new();
    let mut dropped = 0usize;

    for item in &items {
        let source = reference(item, &["source", "source_id", "character_a_id", "from"]);
        let target = reference(item, &["target", "target_id", "character_b_id", "to"]);
        let (Some(source), Some(target)) = (
            source.as_deref().and_then(|r| resolve(r, characters)),
            target.as_deref().and_then(|r| resolve(r, characters)),
        ) else {
            dropped += 1;
            continue;
        };
        let relation_type = str_field(item, &["relation_type", "type"])
            .map(clean_label)
            .unwrap_or_default();
        if source.id == target.id || relation_type.is_empty() {
            dropped += 1;
            continue;
        }
        let confidence = num_field(item, &["confidence", "strength"])
            .and_then(unit_interval)
            .unwrap_or(DEFAULT_CONFIDENCE);
        let description = str_field(item, &["description"]).unwrap_or_default().trim().to_string();

        let key = label_key(&relation_type);
        if let Some(existing) = out.iter_mut().find(|r| {
            r.source_id == source.id && r.target_id == target.id && label_key(&r.relation_type) == key
        }) {
            if confidence > existing.confidence {
                existing.confidence = confidence;
                existing.description = description;
            }
            continue;
        }
        out.push(InferredRelation {
            source_id: source.id,
            target_id: target.id,
            source_name: source.name.clone(),
            target_name: target.name.clone(),
            relation_type,
            description,
            confidence,
        });
    }

    if dropped > 0 {
        warn!(dropped, "Discarded unusable relationship suggestions");
        warnings.push(format!(
            "{} suggested relationship(s) referenced unknown characters or lacked a type",
            dropped
        ));
    }
    out.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lore_core::config::{ProviderConfig, StorageConfig};
    use lore_core::types::Fact;
    use lore_storage::Database;
    use lore_vector::MockProvider;

    const DIM: usize = 8;

    async fn setup(mock: &Arc<MockProvider>) -> (KnowledgeStore, RelationshipAnalyzer) {
        let db = Arc::new(Database::in_memory().unwrap());
        let store = KnowledgeStore::open(db, DIM, &StorageConfig::default())
            .await
            .unwrap();
        let client = ProviderClient::new(mock.clone(), &ProviderConfig::default(), DIM);
        let analyzer = RelationshipAnalyzer::new(
            store.clone(),
            Arc::new(client),
            RelationshipConfig {
                max_facts_per_character: 2,
                ..Default::default()
            },
        );
        (store, analyzer)
    }

    async fn character(store: &KnowledgeStore, name: &str) -> Character {
        let c = Character::new(name, vec![], "", vec![]).unwrap();
        store.create_character(&c).await.unwrap();
        c
    }

    async fn relate(store: &KnowledgeStore, a: &Character, b: &Character, kind: &str) {
        let r = Relation::new(a.id, b.id, kind, "", None).unwrap();
        store.create_relation(&r).await.unwrap();
    }

    #[tokio::test]
    async fn test_analyze_parses_and_resolves_references() {
        let mock = Arc::new(MockProvider::new(DIM));
        let (store, analyzer) = setup(&mock).await;
        let li = character(&store, "李青").await;
        let wang = character(&store, "王五").await;
        mock.script_completion(
            "Analyze the relationships",
            format!(
                r#"[
                    {{"source": "C1", "target": "C2", "relation_type": "rival", "description": "码头之争", "confidence": 0.8}},
                    {{"source": "{}", "target": "王五", "relation_type": "Rival", "confidence": 0.9}},
                    {{"source": "C1", "target": "C1", "relation_type": "self"}},
                    {{"source": "C1", "target": "Nobody", "relation_type": "friend"}},
                    {{"source": "C2", "target": "C1", "relation_type": "debtor", "strength": 3}}
                ]"#,
                li.id
            ),
        );

        let analysis = analyzer.analyze(&[li.id, wang.id], Some("上海, 1930"), Deadline::none()).await.unwrap();
        assert_eq!(analysis.inferred.len(), 2);
        let debtor = &analysis.inferred[0];
        assert_eq!(debtor.relation_type, "debtor");
        assert_eq!(debtor.source_id, wang.id);
        assert_eq!(debtor.confidence, 1.0);
        let rival = &analysis.inferred[1];
        assert_eq!((rival.source_id, rival.target_id), (li.id, wang.id));
        assert!((rival.confidence - 0.9).abs() < 1e-9);
        assert_eq!(analysis.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_analyze_is_side_effect_free() {
        let mock = Arc::new(MockProvider::new(DIM).with_default_completion(
            r#"[{"source": "C1", "target": "C2", "relation_type": "friend"}]"#,
        ));
        let (store, analyzer) = setup(&mock).await;
        let a = character(&store, "甲").await;
        let b = character(&store, "乙").await;

        let first = analyzer.analyze(&[a.id, b.id], None, Deadline::none()).await.unwrap();
        let second = analyzer.analyze(&[a.id, b.id], None, Deadline::none()).await.unwrap();
        assert_eq!(first.inferred, second.inferred);
        assert!(store.relations_for(a.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_facts_per_character_are_bounded_in_prompt() {
        let mock = Arc::new(MockProvider::new(DIM));
        let (store, analyzer) = setup(&mock).await;
        let a = character(&store, "甲").await;
        let b = character(&store, "乙").await;
        for i in 0..5 {
            let f = Fact::new(a.id, "经历", &format!("独特经历编号{}", i), None, vec![]).unwrap();
            store.add_fact(&f).await.unwrap();
        }
        let a = store.get_character(a.id).await.unwrap();
        let b = store.get_character(b.id).await.unwrap();
        let prompt = analyzer.compose_prompt(&[a, b], &[], None).await.unwrap();
        assert_eq!(prompt.matches("独特经历编号").count(), 2);
        assert!(prompt.contains("[C1] 甲"));
        assert!(prompt.contains("[C2] 乙"));
    }

    #[tokio::test]
    async fn test_validation() {
        let mock = Arc::new(MockProvider::new(DIM));
        let (store, analyzer) = setup(&mock).await;
        let a = character(&store, "甲").await;

        let err = analyzer.analyze(&[a.id], None, Deadline::none()).await.unwrap_err();
        assert!(matches!(err, LoreError::Validation(_)));
        let err = analyzer.analyze(&[a.id, a.id], None, Deadline::none()).await.unwrap_err();
        assert!(matches!(err, LoreError::Validation(_)));
        let err = analyzer
            .analyze(&[a.id, Uuid::new_v4()], None, Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, LoreError::NotFound { .. }));
        assert_eq!(mock.complete_calls(), 0);
    }

    #[tokio::test]
    async fn test_indirect_paths_respect_depth_and_cycles() {
        let mock = Arc::new(MockProvider::new(DIM));
        let (store, analyzer) = setup(&mock).await;
        let a = character(&store, "A").await;
        let b = character(&store, "B").await;
        let c = character(&store, "C").await;
        let d = character(&store, "D").await;
        let e = character(&store, "E").await;
        // a - b - c - d, plus a cycle b - e - c.
        relate(&store, &a, &b, "friend").await;
        relate(&store, &b, &c, "mentor").await;
        relate(&store, &c, &d, "sibling").await;
        relate(&store, &b, &e, "ally").await;
        relate(&store, &e, &c, "ally").await;

        let paths = analyzer.indirect_paths(&[a.id, c.id, d.id], 2).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!((paths[0].from, paths[0].to), (a.id, c.id));
        assert_eq!(paths[0].depth(), 2);

        let paths = analyzer.indirect_paths(&[a.id, c.id, d.id], 3).await.unwrap();
        let pairs: Vec<(Uuid, Uuid, usize)> = paths.iter().map(|p| (p.from, p.to, p.depth())).collect();
        assert_eq!(pairs, vec![(a.id, c.id, 2), (a.id, d.id, 3)]);
    }

    #[tokio::test]
    async fn test_direct_neighbors_are_not_indirect() {
        let mock = Arc::new(MockProvider::new(DIM));
        let (store, analyzer) = setup(&mock).await;
        let a = character(&store, "A").await;
        let b = character(&store, "B").await;
        relate(&store, &a, &b, "friend").await;
        relate(&store, &b, &a, "friend").await;
        let paths = analyzer.indirect_paths(&[a.id, b.id], 3).await.unwrap();
        assert!(paths.is_empty());
    }
}
