//! # Rowsync Server
//!
//! Runs the bidirectional sync between System A (MySQL) and System B
//! (PostgreSQL): consumes both databases' change feeds, pushes every event
//! through the [`rowsync_engine`] rules and writes the approved rows to the
//! opposite database.
//!
//! A small HTTP surface exposes liveness and the health snapshot.

pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod health;
pub mod publish;
pub mod routes;
pub mod shutdown;
pub mod sync;

use crate::health::SyncMetrics;
use axum::Router;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<SyncMetrics>,
    /// Path whose disk usage is reported
    pub data_dir: PathBuf,
}

/// The HTTP application with tracing applied.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
