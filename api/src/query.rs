use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mjpeg_relay_core::buffer::BufferStats;
use mjpeg_relay_core::RelayState;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::AppState;

/// Offset used when the caller does not pass `offset_ms`.
pub const DEFAULT_OFFSET_MS: u64 = 100;

static X_FRAME_OFFSET_MS: HeaderName = HeaderName::from_static("x-frame-offset-ms");
static X_FRAME_CAPTURED_AT_MS: HeaderName = HeaderName::from_static("x-frame-captured-at-ms");

#[derive(Debug, Deserialize)]
pub struct FrameQuery {
    offset_ms: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub buffer_size: usize,
    pub buffer_duration_ms: u64,
    pub frame_rate: u32,
    pub clients: usize,
    pub relay_state: RelayState,
    pub frames_total: u64,
    pub buffer: BufferStats,
}

/// Validate the raw `offset_ms` parameter against the retention window.
pub fn parse_offset(raw: Option<&str>, retention_ms: u64) -> Result<u64, String> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_OFFSET_MS.min(retention_ms));
    };
    let offset: i64 = raw
        .trim()
        .parse()
        .map_err(|_| format!("Invalid offset_ms parameter: {raw:?} is not an integer"))?;
    if offset < 0 || offset as u64 > retention_ms {
        return Err(format!("offset_ms must be between 0 and {retention_ms}"));
    }
    Ok(offset as u64)
}

/// GET /frame?offset_ms=N: the frame that was on screen N milliseconds ago.
pub async fn get_frame(
    State(state): State<Arc<AppState>>,
    Query(q): Query<FrameQuery>,
) -> Response {
    let buffer = state.relay.buffer();
    let offset_ms = match parse_offset(q.offset_ms.as_deref(), buffer.retention_ms()) {
        Ok(offset) => offset,
        Err(msg) => return (StatusCode::BAD_REQUEST, msg).into_response(),
    };

    let Some(entry) = buffer.query(offset_ms) else {
        debug!(offset_ms, buffered = buffer.len(), "no frame for offset");
        return (StatusCode::NOT_FOUND, "No frame available in buffer").into_response();
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("image/jpeg")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (X_FRAME_OFFSET_MS.clone(), HeaderValue::from(offset_ms)),
            (X_FRAME_CAPTURED_AT_MS.clone(), HeaderValue::from(entry.captured_at_ms)),
        ],
        entry.frame.bytes(),
    )
        .into_response()
}

/// GET /health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let relay = &state.relay;
    Json(HealthResponse {
        status: "healthy",
        buffer_size: relay.buffer().len(),
        buffer_duration_ms: relay.buffer().retention_ms(),
        frame_rate: state.frame_rate,
        clients: relay.hub().len(),
        relay_state: relay.state(),
        frames_total: relay.frames_total(),
        buffer: relay.buffer().stats(),
    })
}
