use crate::error::{ClipRelayError, Result};
use url::Url;

/// Validate a segment-proxy target against the clip's own upstream origins.
///
/// The target must be an absolute `http://` or `https://` URL whose origin
/// (scheme, host and port) equals the origin of one of `allowed`. Anything
/// else is rejected before a request is made.
///
/// # Errors
/// Returns [`ClipRelayError::InvalidProxyTarget`] for unparsable URLs,
/// non-HTTP(S) schemes and foreign origins.
pub fn validate_proxy_target(target: &str, allowed: &[&Url]) -> Result<Url> {
    let parsed = Url::parse(target)
        .map_err(|_| ClipRelayError::InvalidProxyTarget(format!("Invalid URL: {target}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(ClipRelayError::InvalidProxyTarget(format!(
                "Scheme '{scheme}' not allowed"
            )));
        }
    }

    let origin = parsed.origin();
    if allowed.iter().any(|a| a.origin() == origin) {
        Ok(parsed)
    } else {
        Err(ClipRelayError::InvalidProxyTarget(format!(
            "Origin {} not allowed",
            origin.ascii_serialization()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> Url {
        Url::parse("http://nvr.local:5000/api/events/e1/clip.mp4").unwrap()
    }

    fn vod() -> Url {
        Url::parse("https://cdn.example.com/vod/event/e1/index.m3u8").unwrap()
    }

    #[test]
    fn accepts_either_origin() {
        let (video, vod) = (video(), vod());
        let allowed = [&video, &vod];

        assert!(validate_proxy_target("http://nvr.local:5000/other/seg1.ts", &allowed).is_ok());
        assert!(validate_proxy_target("https://cdn.example.com/vod/seg1.ts?x=1", &allowed).is_ok());
        // Default port is part of the origin
        assert!(validate_proxy_target("https://cdn.example.com:443/key.bin", &allowed).is_ok());
    }

    #[test]
    fn rejects_foreign_host() {
        let video = video();
        assert!(matches!(
            validate_proxy_target("http://169.254.169.254/latest/meta-data", &[&video]),
            Err(ClipRelayError::InvalidProxyTarget(_))
        ));
    }

    #[test]
    fn rejects_same_host_other_port_or_scheme() {
        let video = video();
        assert!(validate_proxy_target("http://nvr.local:5001/seg.ts", &[&video]).is_err());
        assert!(validate_proxy_target("https://nvr.local:5000/seg.ts", &[&video]).is_err());
    }

    #[test]
    fn rejects_non_http_schemes_and_garbage() {
        let video = video();
        assert!(validate_proxy_target("file:///etc/passwd", &[&video]).is_err());
        assert!(validate_proxy_target("ftp://nvr.local:5000/seg.ts", &[&video]).is_err());
        assert!(validate_proxy_target("/relative/seg.ts", &[&video]).is_err());
        assert!(validate_proxy_target("", &[&video]).is_err());
    }

    #[test]
    fn empty_allow_list_rejects_everything() {
        assert!(validate_proxy_target("http://nvr.local:5000/seg.ts", &[]).is_err());
    }
}
