//! Streaming GET relay over a pooled keep-alive HTTP client.

use crate::{
    error::{ClipRelayError, Result},
    metrics,
    upstream::headers::sanitize_for_client,
};
use axum::{
    body::Body,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures_util::Stream;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Default number of idle keep-alive connections retained per upstream host.
pub const DEFAULT_POOL_SIZE: usize = 64;

/// Transport settings for [`HttpRelay`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Idle keep-alive connections retained per host for reuse. This does
    /// not cap how many connections may be open at once.
    pub pool_size: usize,
    /// TCP/TLS connect timeout; there is no whole-request timeout
    pub connect_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Upstream GET relay.
///
/// Cheap to clone; all clones share one connection pool. Failures are never
/// retried here, retry policy belongs to the caller.
///
/// Redirects are not followed: a 3xx is handed back as-is, so every URL the
/// relay fetches is one a caller has checked.
#[derive(Clone, Debug)]
pub struct HttpRelay {
    client: Client,
}

impl HttpRelay {
    pub fn new(config: &RelayConfig) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.pool_size)
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client })
    }

    /// Issue a GET to an absolute http(s) URL.
    ///
    /// Status >= 400 is returned as [`ClipRelayError::UpstreamStatus`] after
    /// the body has been drained so the connection can go back to the pool.
    pub async fn get(&self, url: &str, headers: HeaderMap) -> Result<UpstreamResponse> {
        debug!("Relaying GET {}", url);

        let response = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .await
            .inspect_err(|e| {
                warn!("Upstream request to {} failed: {}", url, e);
                metrics::record_upstream_error();
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            warn!("Upstream returned {} for {}", status, url);
            metrics::record_upstream_error();

            // Drain so the keep-alive connection is reusable
            let _ = response.bytes().await;

            return Err(ClipRelayError::UpstreamStatus {
                status,
                url: url.to_string(),
                message: status
                    .canonical_reason()
                    .unwrap_or("upstream error")
                    .to_string(),
            });
        }

        Ok(UpstreamResponse { inner: response })
    }
}

/// Successful (< 400) upstream response with a lazily-read body.
#[derive(Debug)]
pub struct UpstreamResponse {
    inner: reqwest::Response,
}

impl UpstreamResponse {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Finite, single-pass body chunk stream.
    pub fn bytes_stream(self) -> impl Stream<Item = reqwest::Result<Bytes>> + Send + 'static {
        self.inner.bytes_stream()
    }

    /// Whole body as text; compressed bodies arrive already decoded.
    pub async fn text(self) -> Result<String> {
        Ok(self.inner.text().await?)
    }

    /// Re-send this response to the client: upstream status, sanitized
    /// headers, streamed body.
    pub fn into_client_response(self, default_content_type: Option<&'static str>) -> Response {
        let status = self.status();
        let headers = sanitize_for_client(self.headers(), default_content_type);
        let body = Body::from_stream(self.bytes_stream());

        (status, headers, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use http_body_util::BodyExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay() -> HttpRelay {
        HttpRelay::new(&RelayConfig::default()).unwrap()
    }

    #[test]
    fn relay_config_defaults() {
        let cfg = RelayConfig::default();
        assert_eq!(cfg.pool_size, 64);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn exposes_status_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/clip.mp4"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "video/mp4")
                    .set_body_bytes(b"moovdata".to_vec()),
            )
            .mount(&server)
            .await;

        let resp = relay()
            .get(&format!("{}/clip.mp4", server.uri()), HeaderMap::new())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("content-type").unwrap(), "video/mp4");
        assert_eq!(resp.text().await.unwrap(), "moovdata");
    }

    #[tokio::test]
    async fn forwards_request_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("range", "bytes=0-3"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"moov".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let mut headers = HeaderMap::new();
        headers.insert("range", HeaderValue::from_static("bytes=0-3"));
        let resp = relay().get(&server.uri(), headers).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    }

    #[tokio::test]
    async fn error_status_becomes_upstream_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such event"))
            .mount(&server)
            .await;

        let err = relay().get(&server.uri(), HeaderMap::new()).await.unwrap_err();
        match err {
            ClipRelayError::UpstreamStatus { status, message, .. } => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(message, "Not Found");
            }
            other => panic!("expected UpstreamStatus, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn redirects_are_returned_not_followed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/moved"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/elsewhere"),
            )
            .mount(&server)
            .await;

        let resp = relay()
            .get(&format!("{}/moved", server.uri()), HeaderMap::new())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get("location").unwrap(), "/elsewhere");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        // Port 9 (discard) on localhost is not listening in test environments
        let err = relay()
            .get("http://127.0.0.1:9/clip.mp4", HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClipRelayError::Transport(_)));
    }

    #[tokio::test]
    async fn client_response_strips_hop_by_hop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("keep-alive", "timeout=5")
                    .set_body_bytes(b"segment".to_vec()),
            )
            .mount(&server)
            .await;

        let resp = relay()
            .get(&server.uri(), HeaderMap::new())
            .await
            .unwrap()
            .into_client_response(Some("video/mp2t"));

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!resp.headers().contains_key("keep-alive"));
        assert_eq!(resp.headers().get("content-type").unwrap(), "video/mp2t");
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"segment");
    }
}
