//! Lore API crate - tool-call surface and axum HTTP transport.
//!
//! Provides the [`ToolService`] that validates and dispatches tool calls to
//! the knowledge base, plus the REST routes, error mapping and rate limiting
//! that expose it over HTTP.

pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod schema;
pub mod state;
pub mod tools;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
pub use tools::{descriptors, ToolDescriptor, ToolService};
