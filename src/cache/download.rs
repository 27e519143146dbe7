//! Full-object source downloads into the cache directory.

use crate::{
    cache::store::{CacheEntry, CachedSource, TEMP_FILE_PREFIX},
    error::{ClipRelayError, Result},
    metrics,
    upstream::{HttpRelay, sanitize_for_upstream},
};
use axum::http::{HeaderMap, StatusCode, header};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::pin::pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Fetches a clip's source media to a local temp file, once per entry.
#[derive(Clone, Debug)]
pub struct SourceDownloader {
    relay: HttpRelay,
    cache_dir: PathBuf,
}

impl SourceDownloader {
    pub fn new(relay: HttpRelay, cache_dir: PathBuf) -> Self {
        Self { relay, cache_dir }
    }

    /// Return the entry's local copy of `source_url`, downloading it first if
    /// needed.
    ///
    /// Concurrent callers for the same entry share one download. The client's
    /// `Range` is never forwarded: the whole object is always fetched. On
    /// failure the partial file is removed and the next call retries.
    pub async fn ensure_cached(
        &self,
        entry: &Arc<CacheEntry>,
        source_url: &str,
        headers: &HeaderMap,
    ) -> Result<CachedSource> {
        let flight = {
            let mut state = entry.state();
            if let Some(source) = &state.source {
                debug!("Cache HIT for {}", entry.key());
                return Ok(source.clone());
            }

            let (flight, started) = state.source_flight.join_or_start(|id| {
                let downloader = self.clone();
                let entry = Arc::clone(entry);
                let url = source_url.to_string();
                let headers = sanitize_for_upstream(headers, true);

                async move {
                    let result = downloader.download(&url, headers).await;

                    let mut state = entry.state();
                    state.source_flight.settle(id);
                    match &result {
                        Ok(source) => state.source = Some(source.clone()),
                        Err(e) => warn!("Source download for {} failed: {}", entry.key(), e),
                    }
                    result
                }
            });

            if started {
                info!("Cache MISS for {}, downloading {}", entry.key(), source_url);
            } else {
                debug!("Joining in-flight download for {}", entry.key());
            }
            flight
        };

        flight.wait().await
    }

    async fn download(&self, url: &str, headers: HeaderMap) -> Result<CachedSource> {
        let start = Instant::now();
        let response = self.relay.get(url, headers).await?;
        let status = response.status();
        if !status.is_success() {
            warn!("Refusing to cache {} response from {}", status, url);
            return Err(ClipRelayError::UpstreamStatus {
                status: StatusCode::BAD_GATEWAY,
                url: url.to_string(),
                message: format!("unexpected upstream status {}", status.as_u16()),
            });
        }
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

        // The temp path guard deletes the partial file on every early return
        let (file, temp_path) = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .suffix(".mp4")
            .tempfile_in(&self.cache_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut body = pin!(response.bytes_stream());
        let mut written: u64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        let path = temp_path
            .keep()
            .map_err(|e| ClipRelayError::Filesystem(e.error))?;

        metrics::record_download(written);
        info!(
            "Downloaded {} bytes from {} to {:?} in {}ms",
            written,
            url,
            path,
            start.elapsed().as_millis()
        );

        Ok(CachedSource { path, content_type })
    }
}
