//! Lore Storage crate - SQLite persistence and vector indexes.
//!
//! Provides a pooled WAL-mode SQLite database with migrations, trigram
//! full-text lookup, an IVF approximate nearest neighbour index, and the
//! [`KnowledgeStore`] that ties them together for characters, facts and
//! relations.

pub mod db;
pub mod index;
pub mod lexical;
pub mod migrations;
pub mod store;

pub use db::{Database, PooledConnection};
pub use index::{cosine_similarity, IndexHit, IndexMode, IvfParams, VectorIndex, VectorMeta};
pub use store::{
    BacklogScope, DeleteSummary, EmbeddingJob, KnowledgeStore, LexicalMatch, VectorMatch,
};
