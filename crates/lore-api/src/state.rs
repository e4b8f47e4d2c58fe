//! Application state shared across all route handlers.
//!
//! AppState holds the tool service and the request limiter. It is passed to
//! handlers via axum's State extractor.

use std::sync::Arc;
use std::time::Instant;

use lore_core::config::LoreConfig;
use lore_core::error::Result;
use lore_storage::KnowledgeStore;
use lore_vector::ModelProvider;

use crate::rate_limit::RateLimiter;
use crate::tools::ToolService;

/// Shared application state.
///
/// All fields are cheap to clone across handler tasks.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration the server was started with.
    pub config: Arc<LoreConfig>,
    /// Every tool, wired to the store and provider.
    pub tools: Arc<ToolService>,
    /// Token bucket shared by the tool routes.
    pub limiter: RateLimiter,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: LoreConfig,
        store: KnowledgeStore,
        provider: Arc<dyn ModelProvider>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let tools = ToolService::new(config.clone(), store, provider)?;
        Ok(Self {
            limiter: RateLimiter::from_config(&config.api),
            tools: Arc::new(tools),
            config,
            start_time: Instant::now(),
        })
    }
}
