use crate::mode::ClipMode;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Public base URL of this service; rewritten manifests point back here
    pub public_url: String,
    /// NVR API base, e.g. `http://nvr.local:5000/api`
    pub nvr_api_url: String,
    pub is_dev: bool,
    /// Offer the NVR's HLS VOD manifest for each event
    pub vod_enabled: bool,
    /// Delivery mode for devices without an override
    pub clip_mode: ClipMode,
    /// Per-device delivery mode settings
    pub clip_mode_overrides: HashMap<String, ClipMode>,
    /// Directory for downloaded clip sources
    pub cache_dir: PathBuf,
    /// Idle time before a cached clip is evicted (default: 120)
    pub cache_ttl_secs: u64,
    /// Period of the eviction sweep (default: 10)
    pub cache_sweep_interval_secs: u64,
    /// How long a bad VOD playlist is not re-checked (default: 60)
    pub vod_negative_ttl_secs: u64,
    /// How long a good VOD playlist is reused (default: 300)
    pub vod_positive_ttl_secs: u64,
    /// Idle keep-alive connections retained per upstream host (default: 64).
    /// Not a limit on concurrent connections.
    pub upstream_pool_size: usize,
    pub upstream_connect_timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT, PUBLIC_URL
    /// and NVR_API_URL are required.
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        // Check if running in dev mode
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 3000 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        // Public URL: required in prod, defaults to localhost in dev
        let public_url = if is_dev {
            env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
        } else {
            env::var("PUBLIC_URL").map_err(|_| "PUBLIC_URL is required in production")?
        };

        // NVR API: required in prod, defaults to a local NVR in dev
        let nvr_api_url = if is_dev {
            env::var("NVR_API_URL").unwrap_or_else(|_| "http://localhost:5000/api".to_string())
        } else {
            env::var("NVR_API_URL").map_err(|_| "NVR_API_URL is required in production")?
        };

        let vod_enabled = env::var("VOD_ENABLED")
            .unwrap_or_else(|_| "true".to_string())
            .parse()
            .unwrap_or(true);

        // Unknown modes are rejected rather than silently treated as default
        let clip_mode: ClipMode = env::var("CLIP_MODE")
            .unwrap_or_else(|_| "default".to_string())
            .parse()?;
        let clip_mode_overrides =
            parse_mode_overrides(&env::var("CLIP_MODE_OVERRIDES").unwrap_or_default())?;

        let cache_dir = env::var("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir().join("cliprelay"));

        Ok(Config {
            port,
            public_url,
            nvr_api_url,
            is_dev,
            vod_enabled,
            clip_mode,
            clip_mode_overrides,
            cache_dir,
            cache_ttl_secs: env_or("CACHE_TTL_SECS", 120),
            cache_sweep_interval_secs: env_or("CACHE_SWEEP_INTERVAL_SECS", 10),
            vod_negative_ttl_secs: env_or("VOD_NEGATIVE_TTL_SECS", 60),
            vod_positive_ttl_secs: env_or("VOD_POSITIVE_TTL_SECS", 300),
            upstream_pool_size: env_or("UPSTREAM_POOL_SIZE", 64),
            upstream_connect_timeout_secs: env_or("UPSTREAM_CONNECT_TIMEOUT_SECS", 10),
        })
    }

    /// Delivery mode setting for `device_id`.
    pub fn mode_for(&self, device_id: &str) -> ClipMode {
        self.clip_mode_overrides
            .get(device_id)
            .copied()
            .unwrap_or(self.clip_mode)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        // A zero period would panic in tokio::time::interval
        Duration::from_secs(self.cache_sweep_interval_secs.max(1))
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parse `device=mode,device=mode`.
fn parse_mode_overrides(raw: &str) -> Result<HashMap<String, ClipMode>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (device, mode) = pair
                .split_once('=')
                .ok_or_else(|| format!("invalid CLIP_MODE_OVERRIDES entry '{pair}'"))?;
            let device = device.trim();
            if device.is_empty() {
                return Err(format!("missing device in CLIP_MODE_OVERRIDES entry '{pair}'"));
            }
            Ok((device.to_string(), mode.parse()?))
        })
        .collect()
}
