//! Route handler functions for all API endpoints.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use serde_json::Value;

use lore_core::error::LoreError;
use lore_core::types::StoreStats;
use lore_vector::{BreakerState, CacheStats};

use crate::error::ApiError;
use crate::state::AppState;
use crate::tools::{descriptors, ToolDescriptor};

#[derive(Debug, Serialize)]
pub struct ProviderHealth {
    pub kind: String,
    pub breaker: BreakerState,
    pub embedding_model: String,
    pub dimension: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// "healthy", or "degraded" while the provider breaker is not closed.
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub provider: ProviderHealth,
    pub cache: CacheStats,
    pub store: StoreStats,
}

#[derive(Debug, Serialize)]
pub struct ToolsResponse {
    pub tools: Vec<ToolDescriptor>,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let breaker = state.tools.breaker_state();
    let store = state.tools.store().stats().await?;
    let status = match breaker {
        BreakerState::Closed => "healthy",
        _ => "degraded",
    };

    Ok(Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        provider: ProviderHealth {
            kind: state.config.provider.kind.clone(),
            breaker,
            embedding_model: state.config.provider.embedding_model.clone(),
            dimension: state.config.embedding.dimension,
        },
        cache: state.tools.cache_stats(),
        store,
    }))
}

/// GET /api/tools
pub async fn list_tools() -> Json<ToolsResponse> {
    Json(ToolsResponse {
        tools: descriptors(),
    })
}

/// POST /api/tools/{name}
///
/// An empty body is treated as an empty argument object.
pub async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let args = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| LoreError::validation(format!("request body is not valid JSON: {}", e)))?
    };
    let result = state.tools.call(&name, args).await?;
    Ok(Json(result))
}
