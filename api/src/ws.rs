//! WebSocket push endpoint.
//!
//! Every binary message sent to a viewer is one complete JPEG frame. The
//! channel is push-only: anything a viewer sends is logged and ignored.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures_util::{Sink, SinkExt, StreamExt};
use mjpeg_relay_core::ClientId;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::AppState;

/// WebSocket upgrade handler
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.relay.hub();
    let mut frames = hub.register(addr.to_string());
    let client = frames.id();

    let mut ping = tokio::time::interval_at(
        Instant::now() + state.ping_interval,
        state.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();
    let mut sent: u64 = 0;

    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    debug!(client, "frame queue closed, closing socket");
                    send_bounded(&mut sender, Message::Close(None), state.ping_timeout, client).await;
                    break;
                };
                let message = Message::Binary(frame.to_vec());
                if !send_bounded(&mut sender, message, state.ping_timeout, client).await {
                    break;
                }
                sent += 1;
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        debug!(client, "received from viewer: {text}");
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        debug!(client, bytes = data.len(), "received binary from viewer");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > state.ping_timeout {
                    warn!(client, "no response to keep-alive, dropping client");
                    break;
                }
                let keepalive = Message::Ping(Vec::new());
                if !send_bounded(&mut sender, keepalive, state.ping_timeout, client).await {
                    break;
                }
            }
        }
    }

    hub.unregister(client);
    info!(client, peer = %addr, frames = sent, "viewer disconnected");
}

/// Send one message, giving up after `limit`. Returns false when the client
/// is gone or stalled and should be dropped.
async fn send_bounded<S>(sender: &mut S, message: Message, limit: Duration, client: ClientId) -> bool
where
    S: Sink<Message, Error = axum::Error> + Unpin,
{
    match tokio::time::timeout(limit, sender.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(client, error = %e, "send failed, client disconnected");
            false
        }
        Err(_) => {
            warn!(client, timeout_ms = limit.as_millis() as u64, "send timed out, dropping client");
            false
        }
    }
}
