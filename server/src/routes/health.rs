//! Liveness and metrics endpoints.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::error::SyncError;
use crate::health::HealthSnapshot;
use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Current counters, connectivity and resource usage.
async fn metrics(State(state): State<AppState>) -> Result<Json<HealthSnapshot>, SyncError> {
    let snapshot = state.metrics.snapshot(&state.data_dir)?;
    Ok(Json(snapshot))
}

/// Root handler.
async fn root() -> &'static str {
    "Rowsync Sync Server"
}
