//! Lore Insight crate - provider-backed reasoning about characters.
//!
//! Provides:
//! - Tag generation from descriptions or stored characters
//! - Relationship inference and indirect path discovery
//! - Character summaries and development suggestions

pub mod parse;
pub mod profiler;
pub mod relationships;
pub mod tags;

pub use profiler::{CharacterProfiler, CharacterSummary, DevelopmentSuggestions};
pub use relationships::{
    IndirectPath, InferredRelation, PathHop, RelationshipAnalysis, RelationshipAnalyzer,
};
pub use tags::{GeneratedTag, TagGenerator};
