//! Health and metrics endpoints.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use exstreamtv_core::metrics;

use super::AppState;

/// Health check response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub channels: usize,
    pub sessions_open: usize,
    pub pool_live: usize,
    pub pool_containment: bool,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let runtimes = state.channels.list();
    let sessions_open = runtimes
        .iter()
        .map(|r| state.sessions.open_count(r.id()))
        .sum();
    let stats = state.pool.stats();
    Json(HealthResponse {
        status: "ok".to_string(),
        channels: runtimes.len(),
        sessions_open,
        pool_live: stats.live,
        pool_containment: stats.containment,
    })
}

/// `GET /metrics` — Prometheus text exposition.
pub async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    if !state.config.server.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
        .into_response()
}
