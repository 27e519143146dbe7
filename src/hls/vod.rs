//! Per-clip VOD playlist loading with positive and negative caching.

use crate::{
    cache::{CacheEntry, Clock},
    error::ClipRelayError,
    hls::playlist::{fetch_playlist_text, is_manifest},
    metrics,
    upstream::HttpRelay,
};
use axum::http::HeaderMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// How long a failed playlist check suppresses re-validation.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(60);

/// How long a good playlist body is reused without refetching.
pub const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VodPolicy {
    pub negative_ttl: Duration,
    pub positive_ttl: Duration,
}

impl Default for VodPolicy {
    fn default() -> Self {
        Self {
            negative_ttl: DEFAULT_NEGATIVE_TTL,
            positive_ttl: DEFAULT_POSITIVE_TTL,
        }
    }
}

/// Loads the raw (pre-rewrite) VOD playlist of a clip.
#[derive(Clone, Debug)]
pub struct VodPlaylists {
    relay: HttpRelay,
    policy: VodPolicy,
    clock: Arc<dyn Clock>,
}

impl VodPlaylists {
    pub fn new(relay: HttpRelay, policy: VodPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            relay,
            policy,
            clock,
        }
    }

    /// Return the clip's playlist text, or `None` if it is unusable.
    ///
    /// A recent failure answers `None` without touching the network; a
    /// recent success is reused as-is. Otherwise one fetch per entry runs at
    /// a time and concurrent callers share its outcome.
    pub async fn load(
        &self,
        entry: &Arc<CacheEntry>,
        vod_url: &Url,
        headers: &HeaderMap,
    ) -> Option<Arc<str>> {
        let flight = {
            let mut state = entry.state();
            let now = self.clock.now();
            let vod = &state.vod;

            if vod.usable == Some(false)
                && vod
                    .last_checked_at
                    .is_some_and(|t| now.saturating_duration_since(t) < self.policy.negative_ttl)
            {
                debug!("VOD playlist for {} recently unusable, skipping", entry.key());
                return None;
            }

            if vod.usable == Some(true)
                && let (Some(text), Some(fetched_at)) = (&vod.playlist_text, vod.playlist_fetched_at)
                && now.saturating_duration_since(fetched_at) < self.policy.positive_ttl
            {
                debug!("VOD playlist cache HIT for {}", entry.key());
                return Some(Arc::clone(text));
            }

            let (flight, started) = state.vod_flight.join_or_start(|id| {
                let relay = self.relay.clone();
                let clock = Arc::clone(&self.clock);
                let entry = Arc::clone(entry);
                let url = vod_url.clone();
                let headers = headers.clone();

                async move {
                    let result = fetch_playlist_text(&relay, url.as_str(), &headers)
                        .await
                        .and_then(|text| {
                            if is_manifest(&text) {
                                Ok(Arc::<str>::from(text))
                            } else {
                                Err(ClipRelayError::InvalidManifest(url.to_string()))
                            }
                        });

                    let now = clock.now();
                    let mut state = entry.state();
                    state.vod_flight.settle(id);
                    state.vod.last_checked_at = Some(now);
                    match &result {
                        Ok(text) => {
                            state.vod.usable = Some(true);
                            state.vod.playlist_text = Some(Arc::clone(text));
                            state.vod.playlist_fetched_at = Some(now);
                            metrics::record_playlist_fetch("ok");
                        }
                        Err(e) => {
                            state.vod.usable = Some(false);
                            state.vod.playlist_text = None;
                            let outcome = match e {
                                ClipRelayError::InvalidManifest(_) => "invalid",
                                _ => "error",
                            };
                            metrics::record_playlist_fetch(outcome);
                        }
                    }
                    result
                }
            });

            if started {
                info!("Fetching VOD playlist for {} from {}", entry.key(), vod_url);
            } else {
                debug!("Joining in-flight VOD playlist fetch for {}", entry.key());
            }
            flight
        };

        match flight.wait().await {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("VOD playlist for {} unusable: {}", entry.key(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, CacheStore, ManualClock};
    use crate::hls::playlist::{SegmentProxy, rewrite_playlist};
    use crate::upstream::RelayConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PLAYLIST: &str = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXTINF:4,\nseg0.ts\n#EXT-X-ENDLIST\n";

    struct Fixture {
        server: MockServer,
        clock: Arc<ManualClock>,
        store: CacheStore,
        vod: VodPlaylists,
    }

    impl Fixture {
        async fn new() -> Self {
            let server = MockServer::start().await;
            let clock = Arc::new(ManualClock::new());
            let store = CacheStore::new(Duration::from_secs(120), clock.clone());
            let relay = HttpRelay::new(&RelayConfig::default()).unwrap();
            let vod = VodPlaylists::new(relay, VodPolicy::default(), clock.clone());
            Self {
                server,
                clock,
                store,
                vod,
            }
        }

        fn url(&self) -> Url {
            Url::parse(&format!("{}/vod/event/e1/index.m3u8", self.server.uri())).unwrap()
        }

        async fn load(&self) -> Option<Arc<str>> {
            let entry = self.store.touch(CacheKey::new("cam", "e1"));
            self.vod.load(&entry, &self.url(), &HeaderMap::new()).await
        }

        async fn fetches(&self) -> usize {
            self.server.received_requests().await.unwrap().len()
        }
    }

    async fn mount(server: &MockServer, template: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path("/vod/event/e1/index.m3u8"))
            .respond_with(template)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn failure_is_negatively_cached() {
        let fx = Fixture::new().await;
        mount(&fx.server, ResponseTemplate::new(500)).await;

        assert!(fx.load().await.is_none());
        assert_eq!(fx.fetches().await, 1);

        fx.clock.advance(Duration::from_secs(59));
        assert!(fx.load().await.is_none());
        assert_eq!(fx.fetches().await, 1, "no refetch inside the negative window");

        fx.clock.advance(Duration::from_secs(2));
        assert!(fx.load().await.is_none());
        assert_eq!(fx.fetches().await, 2, "revalidated after the window");
    }

    #[tokio::test]
    async fn invalid_body_is_negatively_cached() {
        let fx = Fixture::new().await;
        mount(
            &fx.server,
            ResponseTemplate::new(200).set_body_string("<html>nope</html>"),
        )
        .await;

        assert!(fx.load().await.is_none());
        let entry = fx.store.get(&CacheKey::new("cam", "e1")).unwrap();
        assert_eq!(entry.state().vod.usable, Some(false));
        assert!(fx.load().await.is_none());
        assert_eq!(fx.fetches().await, 1);
    }

    #[tokio::test]
    async fn success_is_reused_within_window() {
        let fx = Fixture::new().await;
        mount(&fx.server, ResponseTemplate::new(200).set_body_string(PLAYLIST)).await;

        let first = fx.load().await.unwrap();
        fx.clock.advance(Duration::from_secs(299));
        let second = fx.load().await.unwrap();
        assert_eq!(fx.fetches().await, 1);
        assert_eq!(first, second);

        let proxy = SegmentProxy::new(
            Url::parse("http://relay.local/videoclip").unwrap(),
            "cam",
            "e1",
        );
        assert_eq!(
            rewrite_playlist(&first, &fx.url(), &proxy).unwrap(),
            rewrite_playlist(&second, &fx.url(), &proxy).unwrap()
        );

        fx.clock.advance(Duration::from_secs(2));
        fx.load().await.unwrap();
        assert_eq!(fx.fetches().await, 2, "revalidated after five minutes");
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_fetch() {
        let fx = Fixture::new().await;
        mount(
            &fx.server,
            ResponseTemplate::new(200)
                .set_body_string(PLAYLIST)
                .set_delay(Duration::from_millis(100)),
        )
        .await;

        let results = futures_util::future::join_all((0..5).map(|_| fx.load())).await;
        assert!(results.iter().all(|r| r.as_deref() == Some(PLAYLIST)));
        assert_eq!(fx.fetches().await, 1);
    }
}
