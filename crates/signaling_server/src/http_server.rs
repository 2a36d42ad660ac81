//! HTTP server with Axum
//!
//! Serves the signaling WebSocket routes next to health and metrics.

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::metrics::METRICS;
use crate::stores::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub store: StoreStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreStatus {
    pub backend: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn run_server(
    config: &Config,
    store: Arc<dyn Store>,
    signaling: Router,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(config.http_bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_bind))?;

    serve(listener, create_router(store, signaling), cancel).await
}

/// Serve `app` on an already bound listener until `cancel` fires
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    info!("Starting HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("HTTP server stopped");
    Ok(())
}

pub fn create_router(store: Arc<dyn Store>, signaling: Router) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { store })
        .merge(signaling)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.store.health().await;
    let healthy = result.is_ok();

    let status = HealthStatus {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: StoreStatus {
            backend: state.store.name().to_string(),
            healthy,
            error: result.err().map(|e| e.to_string()),
        },
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

async fn metrics_handler() -> impl IntoResponse {
    match METRICS.encode() {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        ),
    }
}
