pub mod config;
pub mod deadline;
pub mod error;
pub mod text;
pub mod types;

pub use config::LoreConfig;
pub use deadline::Deadline;
pub use error::{LoreError, Result, TransientKind};
pub use types::*;
