use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use mjpeg_relay_common::config::Config;
use mjpeg_relay_core::Relay;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

pub mod query;
pub mod ws;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

pub struct AppState {
    pub relay: Arc<Relay>,
    /// Configured capture rate, reported by /health.
    pub frame_rate: u32,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, config: &Config) -> Self {
        Self {
            relay,
            frame_rate: config.capture.fps,
            ping_interval: Duration::from_secs(config.server.ping_interval_secs.max(1)),
            ping_timeout: Duration::from_secs(config.server.ping_timeout_secs.max(1)),
        }
    }
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

/// Historical frame lookups and liveness.
pub fn query_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/frame", get(query::get_frame))
        .route("/health", get(query::health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Live frame push over WebSocket.
pub fn ws_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws::ws_upgrade))
        .route("/ws", get(ws::ws_upgrade))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
}
