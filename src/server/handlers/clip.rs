use crate::{
    error::Result,
    metrics,
    server::{handlers::ClipQuery, state::AppState},
};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, Uri},
    response::Response,
};
use std::time::Instant;
use tracing::info;

/// Serve an event clip: MP4, HLS manifest, or a proxied HLS segment.
pub async fn serve_clip(
    State(state): State<AppState>,
    Query(query): Query<ClipQuery>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response> {
    let start = Instant::now();
    let (device_id, event_id) = query.identity()?;
    info!("Serving clip for device {} event {}", device_id, event_id);

    let clip = state
        .nvr
        .clip_source(&device_id, &event_id, state.config.mode_for(&device_id))?;
    let result = state.streamer.stream(&uri, &headers, &clip).await;

    let status = match &result {
        Ok(response) => response.status(),
        Err(e) => e.status_code(),
    };
    metrics::record_request("videoclip", status.as_u16());
    metrics::record_duration("videoclip", start);

    result
}
