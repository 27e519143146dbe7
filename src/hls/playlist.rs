//! HLS VOD manifest fetching and same-origin URI rewriting.
//!
//! The manifest is rewritten line by line rather than round-tripped through a
//! parser, so tags we do not understand survive byte-for-byte. Every segment
//! line, and the `URI="..."` of `EXT-X-MAP` / `EXT-X-KEY` tags, is resolved
//! against the manifest URL and replaced by a segment-proxy URL that carries
//! the absolute target in its `u` query parameter.

use crate::{
    error::{ClipRelayError, Result},
    upstream::{HttpRelay, sanitize_for_upstream},
};
use axum::http::{HeaderMap, HeaderValue, header};
use tracing::{debug, warn};
use url::Url;

/// First line of every HLS manifest.
pub const MANIFEST_MARKER: &str = "#EXTM3U";

/// Query flag marking a segment-proxy sub-request.
pub const SEGMENT_MARKER_PARAM: &str = "seg";

/// Query parameter carrying the absolute proxied target URL.
pub const TARGET_PARAM: &str = "u";

/// Tags whose quoted `URI` attribute is routed through the segment proxy.
const URI_TAGS: [&str; 2] = ["#EXT-X-MAP:", "#EXT-X-KEY:"];

/// Builds same-origin segment-proxy URLs for one clip.
#[derive(Debug, Clone)]
pub struct SegmentProxy {
    endpoint: Url,
    device_id: String,
    event_id: String,
}

impl SegmentProxy {
    /// `endpoint` is the public URL of the clip endpoint, e.g.
    /// `https://relay.example.com/videoclip`.
    pub fn new(endpoint: Url, device_id: &str, event_id: &str) -> Self {
        Self {
            endpoint,
            device_id: device_id.to_string(),
            event_id: event_id.to_string(),
        }
    }

    /// Proxy URL that fetches `target` on behalf of the player.
    pub fn url_for(&self, target: &Url) -> String {
        let mut url = self.endpoint.clone();
        url.set_query(None);
        url.query_pairs_mut()
            .append_pair("deviceId", &self.device_id)
            .append_pair("eventId", &self.event_id)
            .append_pair(SEGMENT_MARKER_PARAM, "1")
            .append_pair(TARGET_PARAM, target.as_str());
        url.into()
    }
}

/// Cheap validity check: the body must open with `#EXTM3U`.
pub fn is_manifest(text: &str) -> bool {
    text.trim_start_matches('\u{feff}')
        .trim_start()
        .starts_with(MANIFEST_MARKER)
}

/// GET a manifest body as text.
///
/// Identity encoding is requested; `gzip`, `br` and `deflate` bodies are
/// still accepted and arrive decoded from the client.
pub async fn fetch_playlist_text(
    relay: &HttpRelay,
    url: &str,
    client_headers: &HeaderMap,
) -> Result<String> {
    let mut headers = sanitize_for_upstream(client_headers, true);
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    let response = relay.get(url, headers).await?;
    let text = response.text().await?;
    debug!("Fetched playlist {} ({} bytes)", url, text.len());
    Ok(text)
}

/// Rewrite every external reference of a manifest through `proxy`.
///
/// `base` is the URL the manifest was fetched from; relative URIs are
/// resolved against it.
///
/// # Errors
/// [`ClipRelayError::InvalidManifest`] if the body is not an HLS manifest.
pub fn rewrite_playlist(text: &str, base: &Url, proxy: &SegmentProxy) -> Result<String> {
    if !is_manifest(text) {
        return Err(ClipRelayError::InvalidManifest(base.to_string()));
    }

    let mut output = String::with_capacity(text.len() * 2);
    for line in text.trim_start_matches('\u{feff}').lines() {
        let trimmed = line.trim();

        if trimmed.is_empty() {
            output.push_str(line);
        } else if trimmed.starts_with('#') {
            if URI_TAGS.iter().any(|tag| trimmed.starts_with(tag)) {
                output.push_str(&rewrite_tag_uri(trimmed, base, proxy));
            } else {
                output.push_str(line);
            }
        } else {
            match base.join(trimmed) {
                Ok(target) => output.push_str(&proxy.url_for(&target)),
                Err(e) => {
                    warn!("Unresolvable playlist URI {:?}: {}", trimmed, e);
                    output.push_str(line);
                }
            }
        }
        output.push('\n');
    }

    Ok(output)
}

/// Extract the quoted URI value from a tag line.
///
/// Returns the value (without quotes), the byte offset of the opening quote,
/// and the offset one past the closing quote.
pub fn extract_quoted_uri(line: &str) -> Option<(&str, usize, usize)> {
    let uri_marker = "URI=\"";
    let marker_pos = line.find(uri_marker)?;
    let value_start = marker_pos + uri_marker.len();
    let closing_quote = line[value_start..].find('"')?;

    let value = &line[value_start..value_start + closing_quote];
    Some((value, value_start - 1, value_start + closing_quote + 1))
}

fn rewrite_tag_uri(line: &str, base: &Url, proxy: &SegmentProxy) -> String {
    // e.g. EXT-X-KEY:METHOD=NONE has no URI
    let Some((uri, quote_start, quote_end)) = extract_quoted_uri(line) else {
        return line.to_string();
    };

    let target = match base.join(uri) {
        Ok(target) => target,
        Err(e) => {
            warn!("Unresolvable tag URI {:?}: {}", uri, e);
            return line.to_string();
        }
    };

    let proxied = proxy.url_for(&target);
    let mut result = String::with_capacity(line.len() + proxied.len());
    result.push_str(&line[..quote_start]);
    result.push('"');
    result.push_str(&proxied);
    result.push('"');
    result.push_str(&line[quote_end..]);
    result
}
