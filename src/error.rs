use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, warn};

/// Errors raised while serving clips, thumbnails and proxied segments.
#[derive(Debug, thiserror::Error)]
pub enum ClipRelayError {
    /// Upstream (NVR or VOD host) answered with status >= 400
    #[error("upstream returned {status} for {url}: {message}")]
    UpstreamStatus {
        status: StatusCode,
        url: String,
        message: String,
    },

    /// Connection reset, DNS failure, timeout, or a broken body stream
    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Playlist body does not start with `#EXTM3U`
    #[error("invalid HLS manifest from {0}")]
    InvalidManifest(String),

    /// Segment-proxy target outside the clip's allowed origins
    #[error("invalid target: {0}")]
    InvalidProxyTarget(String),

    /// Missing or malformed request parameters
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Forced VOD delivery could not be served
    #[error("VOD playlist unavailable for {0}")]
    VodUnavailable(String),

    /// Temp file create/write/read failure
    #[error("filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),

    /// Failure of a single-flight operation, observed by one of its waiters
    #[error(transparent)]
    Shared(#[from] Arc<ClipRelayError>),
}

pub type Result<T> = std::result::Result<T, ClipRelayError>;

impl ClipRelayError {
    /// HTTP status surfaced to the end client for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ClipRelayError::UpstreamStatus { status, .. } => *status,
            ClipRelayError::Transport(_) => StatusCode::BAD_GATEWAY,
            ClipRelayError::InvalidManifest(_) => StatusCode::BAD_GATEWAY,
            ClipRelayError::InvalidProxyTarget(_) => StatusCode::BAD_REQUEST,
            ClipRelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ClipRelayError::VodUnavailable(_) => StatusCode::BAD_GATEWAY,
            ClipRelayError::Filesystem(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClipRelayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ClipRelayError::Shared(inner) => inner.status_code(),
        }
    }

    /// Short client-facing message; details stay in the logs.
    fn public_message(&self) -> String {
        match self {
            ClipRelayError::UpstreamStatus { message, .. } => message.clone(),
            ClipRelayError::Transport(_) => "upstream unreachable".to_string(),
            ClipRelayError::InvalidManifest(_) => "invalid manifest".to_string(),
            ClipRelayError::InvalidProxyTarget(_) => "invalid target".to_string(),
            ClipRelayError::InvalidRequest(msg) => msg.clone(),
            ClipRelayError::VodUnavailable(_) => "unavailable".to_string(),
            ClipRelayError::Filesystem(_) | ClipRelayError::Internal(_) => {
                "internal error".to_string()
            }
            ClipRelayError::Shared(inner) => inner.public_message(),
        }
    }
}

impl IntoResponse for ClipRelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        } else {
            warn!("Request rejected: {}", self);
        }

        (status, format!("{}\n", self.public_message())).into_response()
    }
}
