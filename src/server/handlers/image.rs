use crate::{
    error::Result,
    metrics,
    nvr::{StillImage, validate_id},
    server::{handlers::ClipQuery, state::AppState},
    upstream::sanitize_for_upstream,
};
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Relay the event's thumbnail JPEG
pub async fn serve_thumbnail(
    State(state): State<AppState>,
    Query(query): Query<ClipQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    serve_image(&state, &query, &headers, StillImage::Thumbnail, "thumbnail").await
}

/// Relay the event's full-size snapshot JPEG
pub async fn serve_snapshot(
    State(state): State<AppState>,
    Query(query): Query<ClipQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    serve_image(&state, &query, &headers, StillImage::Snapshot, "snapshot").await
}

async fn serve_image(
    state: &AppState,
    query: &ClipQuery,
    headers: &HeaderMap,
    kind: StillImage,
    endpoint: &'static str,
) -> Result<Response> {
    let start = Instant::now();
    let (device_id, event_id) = query.identity()?;
    validate_id("deviceId", &device_id)?;
    let url = state.nvr.image_url(&event_id, kind)?;
    info!("Serving {} for device {} event {}", endpoint, device_id, event_id);

    let result = state
        .relay()
        .get(url.as_str(), sanitize_for_upstream(headers, false))
        .await
        .map(|upstream| upstream.into_client_response(Some("image/jpeg")));

    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => e.status_code(),
    };
    metrics::record_request(endpoint, status.as_u16());
    metrics::record_duration(endpoint, start);

    result
}
