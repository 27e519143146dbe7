use crate::server::state::AppState;
use axum::{Json, extract::State};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub cached_clips: usize,
    pub uptime_seconds: u64,
}

/// Liveness plus a little cache insight
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        cached_clips: state.store().len(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
