//! Long-poll agent transport: three stateless HTTP endpoints carrying the
//! same frames as the persistent transport.
//!
//! - `POST /http-tunnel/register/{key}` creates (or replaces) the entry;
//! - `GET /http-tunnel/poll/{key}` waits up to 30 s for one outbound frame;
//! - `POST /http-tunnel/response/{key}` delivers one inbound frame.
//!
//! Registering, polling, and responding all refresh the entry's activity
//! timestamp; a background reaper removes entries idle for five minutes and
//! fails whatever requests were still routed through them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{debug, info, warn};

use super::registry::{RegisterError, TunnelRegistry, LONGPOLL_IDLE_THRESHOLD};
use super::GatewayState;
use crate::protocol::{TunnelFrame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD};

/// Longest a poll request is held open before answering 204.
pub const POLL_WAIT: Duration = Duration::from_secs(30);

/// Reaper sweep cadence.
pub const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// `POST /http-tunnel/register/{key}`
pub async fn register(state: &GatewayState, key: &str, remote_addr: SocketAddr) -> Response {
    match state
        .registry
        .register_longpoll(key, &remote_addr.to_string())
        .await
    {
        Ok(endpoint_id) => {
            let total_active_tunnels = state.registry.len().await;
            info!(
                key,
                endpoint_id,
                remote_addr = %remote_addr,
                total_active_tunnels,
                "long-poll tunnel registered"
            );
            Json(json!({
                "status": "registered",
                "message": "HTTP tunnel registered successfully",
            }))
            .into_response()
        }
        Err(RegisterError::EmptyKey) => {
            (StatusCode::BAD_REQUEST, "Tunnel key cannot be empty").into_response()
        }
    }
}

/// `GET /http-tunnel/poll/{key}`
///
/// Exactly one frame per 200 response. Cancellation (the agent dropping the
/// request) leaves the outbox untouched: the frame is only taken once
/// `recv` completes.
pub async fn poll(state: &GatewayState, key: &str) -> Response {
    poll_with_wait(state, key, POLL_WAIT).await
}

async fn poll_with_wait(state: &GatewayState, key: &str, wait: Duration) -> Response {
    let Some(outbox) = state.registry.poll_outbox(key).await else {
        return (
            StatusCode::NOT_FOUND,
            "Tunnel not registered. Please register first",
        )
            .into_response();
    };

    let frame = {
        let mut rx = outbox.lock().await;
        tokio::time::timeout(wait, rx.recv()).await
    };

    match frame {
        Ok(Some(frame)) => {
            debug!(key, frame_size = frame.len(), "long-poll frame delivered");
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                frame,
            )
                .into_response()
        }
        // Outbox closed underneath us: the entry was replaced or reaped.
        Ok(None) => (
            StatusCode::NOT_FOUND,
            "Tunnel not registered. Please register first",
        )
            .into_response(),
        Err(_) => {
            debug!(key, "long-poll wait elapsed with no frame");
            StatusCode::NO_CONTENT.into_response()
        }
    }
}

/// `POST /http-tunnel/response/{key}`
pub async fn response(state: &GatewayState, key: &str, req: Request<Body>) -> Response {
    if !state.registry.touch_longpoll(key).await {
        return (
            StatusCode::NOT_FOUND,
            "Tunnel not registered. Please register first",
        )
            .into_response();
    }

    let body =
        match axum::body::to_bytes(req.into_body(), FRAME_HEADER_LEN + MAX_FRAME_PAYLOAD).await {
            Ok(body) => body,
            Err(e) => {
                warn!(key, error = %e, "failed to read long-poll response body");
                return (StatusCode::BAD_REQUEST, "Failed to read response body").into_response();
            }
        };

    let frame = match TunnelFrame::decode(body) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(key, error = %e, "malformed long-poll frame");
            return (StatusCode::BAD_REQUEST, "Invalid message format").into_response();
        }
    };

    debug!(key, request_id = frame.id, kind = frame.kind, "long-poll frame received");
    state.pending.apply(frame).await;

    Json(json!({"status": "received"})).into_response()
}

/// Spawn the background sweep that evicts idle long-poll entries.
pub fn spawn_reaper(registry: Arc<TunnelRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(REAP_INTERVAL);
        loop {
            interval.tick().await;
            let reaped = registry.reap_longpoll(LONGPOLL_IDLE_THRESHOLD).await;
            if !reaped.is_empty() {
                info!(count = reaped.len(), keys = ?reaped, "reaped inactive long-poll tunnels");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::KIND_HTTP_REQ;
    use crate::server::GatewayState;
    use bytes::Bytes;

    fn state() -> GatewayState {
        GatewayState::new(Arc::new(Config::default()))
    }

    fn addr() -> SocketAddr {
        "10.0.0.9:4321".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_then_poll_drains_one_frame() {
        let state = state();
        let resp = register(&state, "gamma", addr()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let agent = state.registry.lookup("gamma").await.unwrap();
        let frame = TunnelFrame::request(5, Bytes::from_static(b"GET / HTTP/1.1\r\n\r\n"));
        agent.dispatch(&frame).await.unwrap();

        let resp = poll_with_wait(&state, "gamma", Duration::from_millis(50)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let delivered = TunnelFrame::decode(body).unwrap();
        assert_eq!(delivered.id, 5);
        assert_eq!(delivered.kind, KIND_HTTP_REQ);

        // The outbox is empty again: the next poll times out with 204.
        let resp = poll_with_wait(&state, "gamma", Duration::from_millis(50)).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_poll_unknown_key_is_not_found() {
        let state = state();
        let resp = poll_with_wait(&state, "missing", Duration::from_millis(10)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_response_applies_frame_to_pending_sink() {
        let state = state();
        register(&state, "gamma", addr()).await;
        let endpoint = state.registry.lookup("gamma").await.unwrap().endpoint_id();

        let id = state.pending.allocate_id();
        let sink = state.pending.register(id, endpoint).await;

        let head = TunnelFrame::response_head(
            id,
            Bytes::from_static(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n"),
        );
        let req = Request::builder()
            .method("POST")
            .body(Body::from(head.encode()))
            .unwrap();
        let resp = response(&state, "gamma", req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let delivered = sink.head_rx.await.unwrap().unwrap();
        assert_eq!(delivered.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_response_rejects_malformed_frames_and_unknown_keys() {
        let state = state();

        let req = Request::builder()
            .method("POST")
            .body(Body::from("tiny"))
            .unwrap();
        assert_eq!(
            response(&state, "missing", req).await.status(),
            StatusCode::NOT_FOUND
        );

        register(&state, "gamma", addr()).await;
        let req = Request::builder()
            .method("POST")
            .body(Body::from("tiny"))
            .unwrap();
        assert_eq!(
            response(&state, "gamma", req).await.status(),
            StatusCode::BAD_REQUEST
        );
    }
}
