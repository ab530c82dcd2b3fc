//! Persistent agent transport: WebSocket registration and the per-agent
//! reader/writer pair.
//!
//! An agent dials `GET /ws/{key}` and upgrades. The connection then runs
//! two tasks:
//!
//! - the **writer** owns the sink exclusively, draining a bounded queue of
//!   encoded frames and interleaving keepalive pings — nothing else ever
//!   writes to the socket;
//! - the **reader** decodes incoming frames and applies them to the pending
//!   table, refreshing its read deadline on every pong.
//!
//! Reader error, a missed deadline, writer failure, or replacement by a new
//! registration all end the connection, deregister the entry, and fail the
//! requests that were in flight through it.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::registry::WRITER_QUEUE_CAPACITY;
use super::GatewayState;
use crate::protocol::{TunnelFrame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};

/// Ping cadence on the agent socket.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// The reader gives up if no pong (or close) arrives for this long.
pub const READ_DEADLINE: Duration = Duration::from_secs(90);

/// `GET /ws/{key}` — upgrade and register a persistent agent.
pub fn register(
    state: GatewayState,
    key: String,
    remote_addr: SocketAddr,
    upgrade: WebSocketUpgrade,
) -> Response {
    if key.is_empty() {
        warn!(remote_addr = %remote_addr, "tunnel registration with empty key");
        return (StatusCode::BAD_REQUEST, "Tunnel key cannot be empty").into_response();
    }

    upgrade
        .max_message_size(FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD)
        .max_frame_size(FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD)
        .on_upgrade(move |socket| handle_agent_socket(socket, state, key, remote_addr))
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: GatewayState,
    key: String,
    remote_addr: SocketAddr,
) {
    let (ws_sink, ws_stream) = socket.split();
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(WRITER_QUEUE_CAPACITY);

    let (endpoint_id, closed_rx) = match state.registry.register_persistent(&key, frame_tx).await {
        Ok(registered) => registered,
        Err(e) => {
            warn!(key = %key, remote_addr = %remote_addr, error = %e, "tunnel registration rejected");
            return;
        }
    };
    let total_active_tunnels = state.registry.len().await;
    info!(
        key = %key,
        endpoint_id,
        remote_addr = %remote_addr,
        total_active_tunnels,
        "tunnel agent connected"
    );

    let writer = tokio::spawn(write_loop(ws_sink, frame_rx));
    read_loop(ws_stream, &state, &key, closed_rx).await;

    state.registry.remove_persistent(&key, endpoint_id).await;
    writer.abort();
    info!(key = %key, endpoint_id, remote_addr = %remote_addr, "tunnel agent disconnected");
}

/// The single writer. Frames come from the registry's dispatch queue; the
/// keepalive ping shares the sink by living in the same task.
async fn write_loop(
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut frame_rx: mpsc::Receiver<Bytes>,
) {
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frame_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_sink.send(Message::Binary(frame)).await.is_err() {
                    break;
                }
            }
            _ = keepalive.tick() => {
                if ws_sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// The single reader. Ends on socket close/error, a missed read deadline,
/// or the registry firing the close signal (replacement).
async fn read_loop(
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    state: &GatewayState,
    key: &str,
    mut closed_rx: oneshot::Receiver<()>,
) {
    let mut deadline = Instant::now() + READ_DEADLINE;
    let mut frames: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut closed_rx => {
                info!(key, frames, "tunnel connection replaced by new registration");
                return;
            }
            () = tokio::time::sleep_until(deadline) => {
                warn!(key, frames, "tunnel read deadline elapsed without pong");
                return;
            }
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        frames += 1;
                        match TunnelFrame::decode(data) {
                            Ok(frame) => state.pending.apply(frame).await,
                            Err(e) => {
                                // Short or oversize frames poison the transport.
                                warn!(key, error = %e, "bad frame from agent, closing tunnel");
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        deadline = Instant::now() + READ_DEADLINE;
                    }
                    // Pings are answered by the WebSocket layer itself.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Text(_))) => {
                        debug!(key, "ignoring text message from agent");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(key, frames, "tunnel socket closed");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!(key, frames, error = %e, "tunnel socket error");
                        return;
                    }
                }
            }
        }
    }
}
