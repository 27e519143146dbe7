use crate::{
    cache::{CacheStore, Clock, SourceDownloader, SystemClock},
    config::Config,
    error::{ClipRelayError, Result},
    hls::{VodPlaylists, VodPolicy},
    metrics,
    nvr::NvrClient,
    stream::ClipStreamer,
    upstream::{HttpRelay, RelayConfig},
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    pub nvr: NvrClient,
    pub streamer: ClipStreamer,
    /// Prometheus handle, `None` if another recorder was already installed
    pub metrics: Option<PrometheusHandle>,
    pub started_at: Instant,
}

impl AppState {
    /// Create a new AppState with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Like [`AppState::new`] with an injected cache clock.
    pub fn with_clock(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let relay = HttpRelay::new(&RelayConfig {
            pool_size: config.upstream_pool_size,
            connect_timeout: Duration::from_secs(config.upstream_connect_timeout_secs),
        })?;

        let store = Arc::new(CacheStore::new(config.cache_ttl(), Arc::clone(&clock)));
        let downloader = SourceDownloader::new(relay.clone(), config.cache_dir.clone());
        let vod = VodPlaylists::new(
            relay.clone(),
            VodPolicy {
                negative_ttl: Duration::from_secs(config.vod_negative_ttl_secs),
                positive_ttl: Duration::from_secs(config.vod_positive_ttl_secs),
            },
            clock,
        );

        let endpoint = format!("{}/videoclip", config.public_url.trim_end_matches('/'));
        let endpoint = Url::parse(&endpoint)
            .map_err(|e| ClipRelayError::Internal(format!("invalid PUBLIC_URL: {e}")))?;

        let nvr = NvrClient::new(&config.nvr_api_url, config.vod_enabled)?;

        Ok(Self {
            config: Arc::new(config),
            nvr,
            streamer: ClipStreamer::new(relay, store, downloader, vod, endpoint),
            metrics: metrics::init(),
            started_at: Instant::now(),
        })
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.streamer.store()
    }

    pub fn relay(&self) -> &HttpRelay {
        self.streamer.relay()
    }
}
