//! Byte-range responses backed by a cached source file.

use crate::{
    cache::{CachedSource, ReaderLease},
    error::{ClipRelayError, Result},
    range::parse_range,
    upstream::sanitize_for_client,
};
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::StreamExt;
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Stream `source` (or the slice named by `range_header`) to the client.
///
/// `lease` moves into the response body and is released when the body is
/// dropped, whether it was read to the end or the client went away.
pub async fn serve_cached_file(
    source: &CachedSource,
    range_header: Option<&str>,
    lease: ReaderLease,
) -> Result<Response> {
    let mut file = File::open(&source.path).await?;
    let size = file.metadata().await?.len();

    let mut headers = HeaderMap::new();
    if let Some(content_type) = &source.content_type {
        headers.insert(header::CONTENT_TYPE, content_type.clone());
    }
    let mut headers = sanitize_for_client(&headers, Some("video/mp4"));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));

    let (status, length) = match parse_range(range_header, size) {
        Some(range) => {
            file.seek(SeekFrom::Start(range.start)).await?;
            headers.insert(
                header::CONTENT_RANGE,
                HeaderValue::from_str(&range.content_range(size))
                    .map_err(|e| ClipRelayError::Internal(e.to_string()))?,
            );
            debug!("Serving bytes {}-{}/{} from {:?}", range.start, range.end, size, source.path);
            (StatusCode::PARTIAL_CONTENT, range.content_length())
        }
        None => (StatusCode::OK, size),
    };
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let stream = ReaderStream::new(file.take(length)).map(move |chunk| {
        let _pinned = &lease;
        chunk
    });

    Ok((status, headers, Body::from_stream(stream)).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheStore, ManualClock};
    use http_body_util::BodyExt;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    const BODY: &[u8] = b"0123456789abcdefghij";

    struct Fixture {
        _file: tempfile::TempPath,
        source: CachedSource,
        store: CacheStore,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BODY).unwrap();
        let path = file.into_temp_path();
        let source = CachedSource {
            path: path.to_path_buf(),
            content_type: None,
        };
        let clock = Arc::new(ManualClock::new());
        let store = CacheStore::new(Duration::from_secs(120), clock.clone());
        Fixture {
            _file: path,
            source,
            store,
            clock,
        }
    }

    async fn body(resp: Response) -> Vec<u8> {
        resp.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn full_read_is_200_without_content_range() {
        let fx = fixture();
        let entry = fx.store.touch(CacheKey::new("cam", "e1"));

        let resp = serve_cached_file(&fx.source, None, entry.acquire_reader())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "20");
        assert_eq!(resp.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/mp4");
        assert!(resp.headers().get(header::CONTENT_RANGE).is_none());
        assert_eq!(body(resp).await, BODY);
    }

    #[tokio::test]
    async fn range_read_is_206_with_exact_slice() {
        let fx = fixture();
        let entry = fx.store.touch(CacheKey::new("cam", "e1"));

        let resp = serve_cached_file(&fx.source, Some("bytes=5-9"), entry.acquire_reader())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 5-9/20");
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "5");
        assert_eq!(body(resp).await, b"56789");

        let resp = serve_cached_file(&fx.source, Some("bytes=-3"), entry.acquire_reader())
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_RANGE], "bytes 17-19/20");
        assert_eq!(body(resp).await, b"hij");
    }

    #[tokio::test]
    async fn unsatisfiable_range_serves_whole_file() {
        let fx = fixture();
        let entry = fx.store.touch(CacheKey::new("cam", "e1"));

        let resp = serve_cached_file(&fx.source, Some("bytes=50-"), entry.acquire_reader())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body(resp).await, BODY);
    }

    #[tokio::test]
    async fn upstream_content_type_is_kept() {
        let mut fx = fixture();
        fx.source.content_type = Some(HeaderValue::from_static("video/quicktime"));
        let entry = fx.store.touch(CacheKey::new("cam", "e1"));

        let resp = serve_cached_file(&fx.source, None, entry.acquire_reader())
            .await
            .unwrap();
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "video/quicktime");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let fx = fixture();
        let entry = fx.store.touch(CacheKey::new("cam", "e1"));
        let source = CachedSource {
            path: fx.source.path.with_extension("gone"),
            content_type: None,
        };

        assert!(serve_cached_file(&source, None, entry.acquire_reader()).await.is_err());
    }

    #[tokio::test]
    async fn dropped_body_deletes_file_of_evicted_entry() {
        let fx = fixture();
        let key = CacheKey::new("cam", "e1");
        let entry = fx.store.touch(key.clone());
        entry.state().source = Some(fx.source.clone());

        let resp = serve_cached_file(&fx.source, None, entry.acquire_reader())
            .await
            .unwrap();

        fx.clock.advance(Duration::from_secs(121));
        assert_eq!(fx.store.sweep(), 1);
        assert!(fx.source.path.exists(), "file kept while the body is alive");

        // Client aborts without reading
        drop(resp);
        assert!(!fx.source.path.exists());
    }
}
