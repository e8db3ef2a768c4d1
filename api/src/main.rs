use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mjpeg_relay_api::{query_router, serve, ws_router, AppState};
use mjpeg_relay_capture::supervisor::check_ffmpeg_available;
use mjpeg_relay_capture::CaptureCommand;
use mjpeg_relay_common::config::Config;
use mjpeg_relay_core::{BroadcastHub, FrameBuffer, Relay, RelayError, RunSummary};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load_with_env(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        display = config.capture.display,
        width = config.capture.width,
        height = config.capture.height,
        fps = config.capture.fps,
        jpeg_quality = config.capture.jpeg_quality,
        buffer_duration_ms = config.buffer.duration_ms,
        ws_port = config.server.ws_port,
        http_port = config.server.http_port,
        "starting mjpeg relay"
    );

    check_ffmpeg_available(&config.capture.ffmpeg_path).await;

    let buffer = Arc::new(FrameBuffer::new(Duration::from_millis(config.buffer.duration_ms)));
    let hub = Arc::new(BroadcastHub::new(config.server.client_queue_frames));
    let relay = Arc::new(
        Relay::new(buffer, hub, config.capture.max_frame_bytes)
            .with_stop_grace(Duration::from_millis(config.capture.stop_grace_ms)),
    );
    let state = Arc::new(AppState::new(Arc::clone(&relay), &config));

    let http_addr = format!("{}:{}", config.server.bind, config.server.http_port);
    let ws_addr = format!("{}:{}", config.server.bind, config.server.ws_port);
    let http_listener = bind_or_exit(&http_addr).await;
    let ws_listener = bind_or_exit(&ws_addr).await;

    let servers_shutdown = CancellationToken::new();
    let http_server = tokio::spawn(serve(
        http_listener,
        query_router(Arc::clone(&state)),
        servers_shutdown.clone(),
    ));
    info!(addr = http_addr, "HTTP frame query server listening");
    let ws_server = tokio::spawn(serve(
        ws_listener,
        ws_router(Arc::clone(&state)),
        servers_shutdown.clone(),
    ));
    info!(addr = ws_addr, "MJPEG WebSocket server listening");

    let signal_relay = Arc::clone(&relay);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_relay.stop();
    });

    let command = CaptureCommand::ffmpeg(&config.capture);
    let code = exit_code(&relay.run(&command).await);

    servers_shutdown.cancel();
    for (name, server) in [("http", http_server), ("ws", ws_server)] {
        match tokio::time::timeout(Duration::from_secs(5), server).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!(server = name, error = %e, "server error"),
            Ok(Err(e)) => error!(server = name, error = %e, "server task failed"),
            Err(_) => warn!(server = name, "server did not shut down in time"),
        }
    }

    info!("mjpeg relay stopped");
    std::process::exit(code);
}

/// Process exit status for a finished relay session. A shutdown requested
/// before capture started is a clean exit.
fn exit_code(result: &Result<RunSummary, RelayError>) -> i32 {
    match result {
        Ok(summary) => {
            info!(
                frames = summary.frames,
                stopped_by_request = summary.stopped_by_request,
                "capture session ended"
            );
            0
        }
        Err(RelayError::ShutdownRequested) => {
            info!("shutdown requested before capture started");
            0
        }
        Err(e) => {
            error!(error = %e, "relay failed");
            1
        }
    }
}

async fn bind_or_exit(addr: &str) -> TcpListener {
    TcpListener::bind(addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to listen for SIGTERM");
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
}
