//! URLs of the NVR's per-event HTTP resources.

use crate::{
    error::{ClipRelayError, Result},
    mode::ClipMode,
    stream::ClipSource,
};
use url::Url;

/// Still image kinds the NVR serves per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillImage {
    Thumbnail,
    Snapshot,
}

impl StillImage {
    fn file_name(self) -> &'static str {
        match self {
            StillImage::Thumbnail => "thumbnail.jpg",
            StillImage::Snapshot => "snapshot.jpg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NvrClient {
    /// API base without trailing slash
    api_base: String,
    vod_enabled: bool,
}

impl NvrClient {
    /// # Errors
    /// [`ClipRelayError::Internal`] if `api_base` is not an absolute http(s) URL.
    pub fn new(api_base: &str, vod_enabled: bool) -> Result<Self> {
        let parsed = Url::parse(api_base)
            .map_err(|e| ClipRelayError::Internal(format!("invalid NVR API URL '{api_base}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ClipRelayError::Internal(format!(
                "NVR API URL must be http(s): {api_base}"
            )));
        }

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            vod_enabled,
        })
    }

    /// `{api}/events/{id}/clip.mp4`
    pub fn clip_url(&self, event_id: &str) -> Result<Url> {
        self.event_url(event_id, "clip.mp4")
    }

    /// `{api}/events/{id}/thumbnail.jpg` or `.../snapshot.jpg`
    pub fn image_url(&self, event_id: &str, kind: StillImage) -> Result<Url> {
        self.event_url(event_id, kind.file_name())
    }

    /// `{api}/vod/event/{id}/index.m3u8`, or `None` with VOD disabled.
    pub fn vod_url(&self, event_id: &str) -> Result<Option<Url>> {
        if !self.vod_enabled {
            return Ok(None);
        }
        validate_id("eventId", event_id)?;
        self.parse(&format!("{}/vod/event/{}/index.m3u8", self.api_base, event_id))
            .map(Some)
    }

    /// Everything the streamer needs to serve one event's clip.
    pub fn clip_source(
        &self,
        device_id: &str,
        event_id: &str,
        mode_setting: ClipMode,
    ) -> Result<ClipSource> {
        validate_id("deviceId", device_id)?;
        Ok(ClipSource {
            device_id: device_id.to_string(),
            event_id: event_id.to_string(),
            video_url: self.clip_url(event_id)?,
            vod_url: self.vod_url(event_id)?,
            mode_setting,
        })
    }

    fn event_url(&self, event_id: &str, file: &str) -> Result<Url> {
        validate_id("eventId", event_id)?;
        self.parse(&format!("{}/events/{}/{}", self.api_base, event_id, file))
    }

    fn parse(&self, url: &str) -> Result<Url> {
        Url::parse(url).map_err(|e| ClipRelayError::Internal(format!("bad NVR URL '{url}': {e}")))
    }
}

/// Identifiers end up in upstream URL paths: ASCII alphanumerics plus
/// `.`, `-` and `_`, and never only dots.
pub fn validate_id(name: &str, value: &str) -> Result<()> {
    let charset_ok = value
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'));

    if value.is_empty() || !charset_ok || value.bytes().all(|b| b == b'.') {
        return Err(ClipRelayError::InvalidRequest(format!("invalid {name}")));
    }
    Ok(())
}
