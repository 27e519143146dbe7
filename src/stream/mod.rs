//! Clip streaming entry point.
//!
//! One call per inbound clip request. Segment-proxy sub-requests are answered
//! first; everything else goes through mode selection and is served as a
//! rewritten HLS manifest, a byte-range read of the cached source, or a
//! plain relay of the upstream MP4.

pub mod file;
pub mod target;

pub use file::serve_cached_file;
pub use target::validate_proxy_target;

use crate::{
    cache::{CacheEntry, CacheKey, CacheStore, SourceDownloader},
    error::{ClipRelayError, Result},
    hls::{
        SegmentProxy, VodPlaylists, fetch_playlist_text,
        playlist::{SEGMENT_MARKER_PARAM, TARGET_PARAM},
        rewrite_playlist,
    },
    mode::{ClientProfile, ClipMode, DeliveryMode, decide_mode},
    upstream::{HttpRelay, sanitize_for_upstream},
};
use axum::{
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

/// Content type of rewritten HLS manifests.
pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

/// Everything known about the clip a request is for.
#[derive(Debug, Clone)]
pub struct ClipSource {
    pub device_id: String,
    pub event_id: String,
    /// Progressive MP4 of the clip
    pub video_url: Url,
    /// HLS VOD manifest of the clip, if the NVR offers one
    pub vod_url: Option<Url>,
    pub mode_setting: ClipMode,
}

impl ClipSource {
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.device_id, &self.event_id)
    }

    /// Upstream origins a segment-proxy target may point at.
    fn allowed_origins(&self) -> Vec<&Url> {
        std::iter::once(&self.video_url)
            .chain(self.vod_url.as_ref())
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct ClipStreamer {
    relay: HttpRelay,
    store: Arc<CacheStore>,
    downloader: SourceDownloader,
    vod: VodPlaylists,
    /// Public URL of the clip endpoint, used for segment-proxy URLs
    endpoint: Url,
}

impl ClipStreamer {
    pub fn new(
        relay: HttpRelay,
        store: Arc<CacheStore>,
        downloader: SourceDownloader,
        vod: VodPlaylists,
        endpoint: Url,
    ) -> Self {
        Self {
            relay,
            store,
            downloader,
            vod,
            endpoint,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn relay(&self) -> &HttpRelay {
        &self.relay
    }

    /// Answer one clip request.
    ///
    /// `request_uri` is only inspected for the segment-proxy parameters;
    /// `headers` are the client's request headers.
    pub async fn stream(
        &self,
        request_uri: &Uri,
        headers: &HeaderMap,
        clip: &ClipSource,
    ) -> Result<Response> {
        if let Some(target) = segment_target(request_uri) {
            return self.proxy_segment(&target, headers, clip).await;
        }

        let client = ClientProfile::from_headers(headers);
        let decision = decide_mode(clip.mode_setting, &client);
        let entry = self.store.touch(clip.cache_key());
        debug!(
            "Clip {} -> {:?} (from {:?})",
            entry.key(),
            decision.mode,
            decision.source
        );

        if decision.mode == DeliveryMode::VodHls {
            if let Some(response) = self.serve_vod(&entry, headers, clip).await {
                return Ok(response);
            }
            if !decision.allows_fallback() {
                return Err(ClipRelayError::VodUnavailable(entry.key().to_string()));
            }
            info!("VOD unavailable for {}, falling back to MP4", entry.key());
        }

        if client.is_installed_app() || client.has_range {
            self.serve_cached(&entry, headers, clip).await
        } else {
            self.relay_direct(headers, clip).await
        }
    }

    fn segment_proxy(&self, clip: &ClipSource) -> SegmentProxy {
        SegmentProxy::new(self.endpoint.clone(), &clip.device_id, &clip.event_id)
    }

    async fn proxy_segment(
        &self,
        raw_target: &str,
        headers: &HeaderMap,
        clip: &ClipSource,
    ) -> Result<Response> {
        let target = validate_proxy_target(raw_target, &clip.allowed_origins())?;

        // Variant playlists of a master manifest must stay same-origin too
        if target.path().ends_with(".m3u8") {
            debug!("Rewriting nested playlist {}", target);
            let text = fetch_playlist_text(&self.relay, target.as_str(), headers).await?;
            let body = rewrite_playlist(&text, &target, &self.segment_proxy(clip))?;
            return Ok(manifest_response(body));
        }

        debug!("Proxying segment {}", target);
        let response = self
            .relay
            .get(target.as_str(), sanitize_for_upstream(headers, false))
            .await?;
        Ok(response.into_client_response(None))
    }

    async fn serve_vod(
        &self,
        entry: &Arc<CacheEntry>,
        headers: &HeaderMap,
        clip: &ClipSource,
    ) -> Option<Response> {
        let Some(vod_url) = &clip.vod_url else {
            debug!("No VOD playlist configured for {}", entry.key());
            return None;
        };

        let text = self.vod.load(entry, vod_url, headers).await?;
        match rewrite_playlist(&text, vod_url, &self.segment_proxy(clip)) {
            Ok(body) => Some(manifest_response(body)),
            Err(e) => {
                warn!("VOD playlist for {} not servable: {}", entry.key(), e);
                None
            }
        }
    }

    async fn serve_cached(
        &self,
        entry: &Arc<CacheEntry>,
        headers: &HeaderMap,
        clip: &ClipSource,
    ) -> Result<Response> {
        // Held from before the download so an eviction cannot pull the file
        // out between caching and opening it
        let lease = entry.acquire_reader();
        let source = self
            .downloader
            .ensure_cached(entry, clip.video_url.as_str(), headers)
            .await?;

        let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
        serve_cached_file(&source, range, lease)
            .await
            .inspect_err(|e| {
                if is_not_found(e) {
                    entry.forget_source(&source.path);
                }
            })
    }

    async fn relay_direct(&self, headers: &HeaderMap, clip: &ClipSource) -> Result<Response> {
        debug!("Relaying {} directly", clip.video_url);
        let response = self
            .relay
            .get(clip.video_url.as_str(), sanitize_for_upstream(headers, false))
            .await?;
        Ok(response.into_client_response(Some("video/mp4")))
    }
}

/// The proxied target of a segment-proxy sub-request, if this is one.
fn segment_target(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    let mut is_segment = false;
    let mut target = None;

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == SEGMENT_MARKER_PARAM {
            is_segment = !value.is_empty() && value != "0";
        } else if key == TARGET_PARAM {
            target = Some(value.into_owned());
        }
    }

    target.filter(|_| is_segment)
}

/// Whether a cached-file error means the file itself is gone.
fn is_not_found(err: &ClipRelayError) -> bool {
    match err {
        ClipRelayError::Filesystem(e) => e.kind() == std::io::ErrorKind::NotFound,
        ClipRelayError::Shared(inner) => is_not_found(inner),
        _ => false,
    }
}

fn manifest_response(body: String) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HLS_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}
