//! Delivery mode selection for clip requests.
//!
//! An explicit per-camera setting always wins. Without one, installed mobile
//! apps get HLS (their webviews mishandle MP4 range negotiation) and every
//! other client gets MP4.

use axum::http::{HeaderMap, header};
use std::fmt;
use std::str::FromStr;

/// User-Agent tokens of mobile operating systems (lowercase).
const MOBILE_OS_TOKENS: [&str; 4] = ["iphone", "ipad", "ipod", "android"];

/// User-Agent markers of installed companion apps and embedded webviews (lowercase).
const INSTALLED_APP_MARKERS: [&str; 4] = ["scrypted", "homeassistant", "home assistant", "; wv)"];

/// Per-camera delivery setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipMode {
    /// Decide from the client
    #[default]
    Default,
    Mp4,
    VodHls,
}

impl FromStr for ClipMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "default" | "auto" => Ok(ClipMode::Default),
            "mp4" => Ok(ClipMode::Mp4),
            "vod-hls" | "vod_hls" | "vodhls" | "vod" | "hls" => Ok(ClipMode::VodHls),
            other => Err(format!("unknown clip mode '{other}'")),
        }
    }
}

impl fmt::Display for ClipMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClipMode::Default => "default",
            ClipMode::Mp4 => "mp4",
            ClipMode::VodHls => "vod-hls",
        })
    }
}

/// Concrete delivery strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Mp4,
    VodHls,
}

/// Where a [`DeliveryMode`] came from. Only defaulted HLS may fall back to MP4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    Setting,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModeDecision {
    pub mode: DeliveryMode,
    pub source: ModeSource,
}

impl ModeDecision {
    pub fn allows_fallback(&self) -> bool {
        self.source == ModeSource::Default
    }
}

/// Client request metadata relevant to mode selection.
#[derive(Debug, Clone, Default)]
pub struct ClientProfile {
    pub user_agent: String,
    pub accept: Option<String>,
    pub has_range: bool,
    /// `Sec-CH-UA-Mobile: ?1`
    pub mobile_hint: bool,
    /// `Sec-CH-UA-Platform`, unquoted
    pub platform_hint: Option<String>,
}

impl ClientProfile {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
        };

        Self {
            user_agent: text(header::USER_AGENT.as_str()).unwrap_or_default(),
            accept: text(header::ACCEPT.as_str()),
            has_range: headers.contains_key(header::RANGE),
            mobile_hint: text("sec-ch-ua-mobile").is_some_and(|v| v == "?1"),
            platform_hint: text("sec-ch-ua-platform").map(|v| v.trim_matches('"').to_string()),
        }
    }

    /// Running on a mobile OS, by User-Agent token or client hints.
    pub fn is_mobile(&self) -> bool {
        let ua = self.user_agent.to_lowercase();
        MOBILE_OS_TOKENS.iter().any(|t| ua.contains(t))
            || self.mobile_hint
            || self
                .platform_hint
                .as_deref()
                .is_some_and(|p| p.eq_ignore_ascii_case("android") || p.eq_ignore_ascii_case("ios"))
    }

    /// A mobile installed app (or its webview) rather than a browser.
    pub fn is_installed_app(&self) -> bool {
        let ua = self.user_agent.to_lowercase();
        self.is_mobile() && INSTALLED_APP_MARKERS.iter().any(|m| ua.contains(m))
    }
}

/// Pick the delivery mode for a request.
pub fn decide_mode(setting: ClipMode, client: &ClientProfile) -> ModeDecision {
    match setting {
        ClipMode::Mp4 => ModeDecision {
            mode: DeliveryMode::Mp4,
            source: ModeSource::Setting,
        },
        ClipMode::VodHls => ModeDecision {
            mode: DeliveryMode::VodHls,
            source: ModeSource::Setting,
        },
        ClipMode::Default => ModeDecision {
            mode: if client.is_installed_app() {
                DeliveryMode::VodHls
            } else {
                DeliveryMode::Mp4
            },
            source: ModeSource::Default,
        },
    }
}
