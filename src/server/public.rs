//! Public tunneled-request handler.
//!
//! A public request is admitted (per-IP, then per-key), serialized into a
//! kind-1 frame, and dispatched to the agent registered for its tunnel key.
//! The response is streamed: the first kind-2 frame sets status and
//! headers, each kind-3 frame appends body bytes as it arrives, and the
//! empty sentinel ends the stream. The whole exchange is bounded by a
//! 90-second deadline; once headers are out, failures truncate the body
//! rather than changing the status.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    http::{header::HeaderMap, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::pending::{SinkFailure, REQUEST_DEADLINE};
use super::registry::DispatchError;
use super::GatewayState;
use crate::protocol::http::{is_hop_by_hop, serialize_request, ResponseHead};
use crate::protocol::{TunnelFrame, MAX_FRAME_PAYLOAD};

/// Header naming the tunnel a public request should be routed through.
pub const TUNNEL_KEY_HEADER: &str = "x-tunnel-key";

/// Key assumed when the header is missing or empty.
pub const DEFAULT_TUNNEL_KEY: &str = "default";

/// Resolve the client IP for admission: `X-Forwarded-For` wins, then
/// `X-Real-IP`, then the socket address.
pub(crate) fn client_ip(headers: &HeaderMap, remote_addr: SocketAddr) -> IpAddr {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            if let Ok(ip) = first.trim().parse() {
                return ip;
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if let Ok(ip) = real.trim().parse() {
            return ip;
        }
    }
    remote_addr.ip()
}

pub async fn handle(state: &GatewayState, remote_addr: SocketAddr, req: Request<Body>) -> Response {
    let started = Instant::now();
    let ip = client_ip(req.headers(), remote_addr);

    if !state.ip_limiter.allow(&ip.to_string()) {
        warn!(client_ip = %ip, "IP rate limited");
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests from your IP").into_response();
    }

    let key = req
        .headers()
        .get(TUNNEL_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .unwrap_or(DEFAULT_TUNNEL_KEY)
        .to_string();

    if !state.key_limiter.allow(&key) {
        warn!(client_ip = %ip, key = %key, "key rate limited");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            "Too many requests for this service",
        )
            .into_response();
    }

    let Some(agent) = state.registry.lookup(&key).await else {
        let kinds = state.registry.kinds(&key).await;
        let active_tunnels = state.registry.len().await;
        warn!(
            client_ip = %ip,
            key = %key,
            ?kinds,
            active_tunnels,
            "no active tunnel for key"
        );
        return (StatusCode::BAD_GATEWAY, "Service unavailable").into_response();
    };

    // Serialize the request into its kind-1 wire form. The body is read in
    // full here; anything past the frame limit cannot be tunneled.
    let (parts, body) = req.into_parts();
    let target = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let body = match axum::body::to_bytes(body, MAX_FRAME_PAYLOAD).await {
        Ok(body) => body,
        Err(e) => {
            warn!(client_ip = %ip, key = %key, error = %e, "failed to read request body");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };
    let payload = serialize_request(parts.method.as_str(), &target, &parts.headers, &body);

    let request_id = state.pending.allocate_id();
    debug!(
        client_ip = %ip,
        key = %key,
        request_id,
        method = %parts.method,
        target = %target,
        payload_size = payload.len(),
        "dispatching public request"
    );

    let mut sink = state
        .pending
        .register(request_id, agent.endpoint_id())
        .await;

    if let Err(e) = agent
        .dispatch(&TunnelFrame::request(request_id, payload))
        .await
    {
        state.pending.remove(request_id).await;
        warn!(client_ip = %ip, key = %key, request_id, error = %e, "failed to forward request");
        return match e {
            DispatchError::Busy => {
                (StatusCode::SERVICE_UNAVAILABLE, "Tunnel client busy").into_response()
            }
            DispatchError::NoTunnel => {
                (StatusCode::BAD_GATEWAY, "Failed to forward request").into_response()
            }
        };
    }

    // The watchdog enforces the deadline even after this handler has
    // returned a streaming response; expiry on a finished request is a no-op.
    let pending = Arc::clone(&state.pending);
    tokio::spawn(async move {
        tokio::time::sleep(REQUEST_DEADLINE).await;
        pending.expire(request_id).await;
    });

    match tokio::time::timeout(REQUEST_DEADLINE, &mut sink.head_rx).await {
        Ok(Ok(Ok(head))) => {
            info!(
                client_ip = %ip,
                key = %key,
                request_id,
                status = %head.status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "streaming response to client"
            );
            streamed_response(head, sink.body_rx)
        }
        Ok(Ok(Err(SinkFailure::TimedOut))) | Err(_) => {
            state.pending.remove(request_id).await;
            warn!(client_ip = %ip, key = %key, request_id, "timeout waiting for response stream");
            (StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout").into_response()
        }
        Ok(Ok(Err(SinkFailure::AgentGone))) | Ok(Err(_)) => {
            state.pending.remove(request_id).await;
            warn!(client_ip = %ip, key = %key, request_id, "tunnel died before response headers");
            (StatusCode::BAD_GATEWAY, "Service unavailable").into_response()
        }
    }
}

/// Build the streaming public response from a parsed head and the body
/// channel. Hop-by-hop headers never survive the tunnel.
fn streamed_response(
    head: ResponseHead,
    body_rx: tokio::sync::mpsc::Receiver<super::pending::BodyResult>,
) -> Response {
    let mut builder = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(ReceiverStream::new(body_rx)))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::KIND_HTTP_REQ;
    use axum::http::HeaderValue;
    use bytes::Bytes;

    fn state() -> GatewayState {
        GatewayState::new(Arc::new(Config::default()))
    }

    fn addr() -> SocketAddr {
        "93.184.216.34:50000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.1.2.3, 10.9.9.9"));
        headers.insert("x-real-ip", HeaderValue::from_static("10.4.5.6"));
        assert_eq!(client_ip(&headers, addr()), "10.1.2.3".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_ip_falls_back_to_real_ip_then_socket() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.4.5.6"));
        assert_eq!(client_ip(&headers, addr()), "10.4.5.6".parse::<IpAddr>().unwrap());

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, addr()), "93.184.216.34".parse::<IpAddr>().unwrap());

        // Garbage in the headers falls through to the socket address.
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(client_ip(&headers, addr()), "93.184.216.34".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_request_without_agent_is_bad_gateway() {
        let state = state();
        let req = Request::builder()
            .uri("/hello")
            .header(TUNNEL_KEY_HEADER, "beta")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&state, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_happy_path_streams_agent_response() {
        let state = state();
        let (frame_tx, mut frame_rx) = tokio::sync::mpsc::channel(8);
        state
            .registry
            .register_persistent("alpha", frame_tx)
            .await
            .unwrap();

        // Fake agent: answer the dispatched request with head + body + sentinel.
        let pending = Arc::clone(&state.pending);
        tokio::spawn(async move {
            let raw = frame_rx.recv().await.unwrap();
            let frame = TunnelFrame::decode(raw).unwrap();
            assert_eq!(frame.kind, KIND_HTTP_REQ);
            assert!(frame.payload.starts_with(b"GET /hello HTTP/1.1\r\n"));

            let head = Bytes::from_static(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\n");
            pending.apply(TunnelFrame::response_head(frame.id, head)).await;
            pending
                .apply(TunnelFrame::chunk(frame.id, Bytes::from_static(b"Hi")))
                .await;
            pending.apply(TunnelFrame::end_of_stream(frame.id)).await;
        });

        let req = Request::builder()
            .uri("/hello")
            .header(TUNNEL_KEY_HEADER, "alpha")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&state, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"Hi");
        assert!(state.pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_full_longpoll_outbox_is_service_unavailable() {
        let state = state();
        state
            .registry
            .register_longpoll("gamma", "10.0.0.1:1")
            .await
            .unwrap();

        // Saturate the outbox so the next public dispatch is refused.
        let agent = state.registry.lookup("gamma").await.unwrap();
        let filler = TunnelFrame::request(0, Bytes::from_static(b"x"));
        while agent.dispatch(&filler).await.is_ok() {}

        let req = Request::builder()
            .uri("/hello")
            .header(TUNNEL_KEY_HEADER, "gamma")
            .body(Body::empty())
            .unwrap();
        let resp = handle(&state, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(state.pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_empty_tunnel_key_header_means_default() {
        let state = state();
        let req = Request::builder()
            .uri("/x")
            .header(TUNNEL_KEY_HEADER, "")
            .body(Body::empty())
            .unwrap();
        // No "default" agent registered: the request must 502 (not 400), which
        // proves the empty header collapsed to the default key.
        let resp = handle(&state, addr(), req).await;
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }
}
