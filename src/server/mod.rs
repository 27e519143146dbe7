pub mod handlers;
pub mod state;

use crate::{cache::store::purge_stale_files, config::Config, error::Result};
use axum::{
    Router,
    extract::Request,
    http::{HeaderName, HeaderValue, Method, header},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use state::AppState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

const VERSION_HEADER: HeaderName = HeaderName::from_static("x-cliprelay-version");

/// Build the full router for `config` with the system clock.
pub async fn build_router(config: Config) -> Result<Router> {
    Ok(build_router_with_state(AppState::new(config)?))
}

/// Build the router around an existing state.
pub fn build_router_with_state(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD])
        .allow_headers([header::RANGE])
        .expose_headers([header::CONTENT_RANGE, header::CONTENT_LENGTH, header::ACCEPT_RANGES]);

    Router::new()
        .route("/", get(handlers::health::health_check))
        .route("/health", get(handlers::health::health_check))
        .route("/metrics", get(handlers::metrics::serve_metrics))
        .route("/videoclip", get(handlers::clip::serve_clip))
        .route("/thumbnail", get(handlers::image::serve_thumbnail))
        .route("/snapshot", get(handlers::image::serve_snapshot))
        .layer(middleware::from_fn(version_header))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn version_header(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        VERSION_HEADER,
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

/// Start the Axum HTTP server
pub async fn start(config: Config) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", config.port);

    tokio::fs::create_dir_all(&config.cache_dir).await?;
    let purged = purge_stale_files(&config.cache_dir).await;
    if purged > 0 {
        info!("🧹 Removed {} stale cached clips from {:?}", purged, config.cache_dir);
    }

    let sweep_interval = config.cache_sweep_interval();
    let state = AppState::new(config)?;
    let shutdown = CancellationToken::new();
    let sweeper = state.store().spawn_sweeper(sweep_interval, shutdown.clone());
    let app = build_router_with_state(state.clone());

    // Bind TCP listener
    let listener = match tokio::net::TcpListener::bind(addr.as_str()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to address {}: {}", addr, e);
            return Err(e.into());
        }
    };

    info!("🚀 Server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        error!("Cache sweeper task failed: {}", e);
    }
    // Cached clips never outlive the process
    state.store().clear();

    if let Err(e) = served {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
