//! Dashboard-facing HTTP JSON API over the query engine.

mod error;
mod handlers;

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use telemetry_engine::Engine;
use tokio_util::sync::CancellationToken;

pub use error::ApiError;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Engine,
    /// Cancels in-flight rebuilds on shutdown.
    pub shutdown: CancellationToken,
}

/// Build the query API router:
/// - `GET /health`
/// - `GET /api/usage/total`
/// - `GET /api/usage/series`
/// - `GET /api/usage/top`
/// - `GET /api/meters/:meter_id/profile`
/// - `POST /api/index/rebuild`
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/usage/total", get(handlers::usage_total))
        .route("/api/usage/series", get(handlers::usage_series))
        .route("/api/usage/top", get(handlers::usage_top))
        .route("/api/meters/:meter_id/profile", get(handlers::meter_profile))
        .route("/api/index/rebuild", post(handlers::rebuild_index))
        .with_state(state)
}

/// Serve the API on `bind_addr` until `shutdown` fires.
pub async fn serve(bind_addr: &str, state: ApiState) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid query_api.bind_addr '{bind_addr}': {e}"))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "query api listening");

    let shutdown = state.shutdown.clone();
    axum::serve(listener, build_router(state).into_make_service())
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
