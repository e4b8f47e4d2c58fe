//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with tracing, compression, a body limit and the
//! tool-call rate limiter.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::{Extension, Router};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use lore_core::error::{LoreError, Result};

use crate::handlers;
use crate::rate_limit::rate_limit_middleware;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
///
/// `/health` and the tool listing are exempt from rate limiting.
pub fn create_router(state: AppState) -> Router {
    let limited = Router::new()
        .route("/api/tools/{name}", post(handlers::call_tool))
        .layer(axum::middleware::from_fn(rate_limit_middleware))
        .layer(Extension(state.limiter.clone()));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/tools", get(handlers::list_tools))
        .merge(limited)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(DefaultBodyLimit::max(state.config.api.max_body_bytes)),
        )
        .with_state(state)
}

/// Serve on `127.0.0.1:<general.port>` until ctrl-c.
pub async fn start_server(state: AppState) -> Result<()> {
    let addr = format!("127.0.0.1:{}", state.config.general.port);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| LoreError::Config(format!("Failed to bind {}: {}", addr, e)))?;
    tracing::info!("Starting API server on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
            }
        })
        .await?;
    Ok(())
}
