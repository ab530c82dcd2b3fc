//! Connection-level protocol detection and HTTP path routing.
//!
//! Every accepted connection gets a 5-second window to produce at least one
//! byte. `0x05` means SOCKS5; anything else is treated as HTTP/1.1 and
//! served through the axum router, one connection at a time, with upgrades
//! enabled so the persistent transport can take over the socket.
//!
//! Path routing is suffix-tolerant: `/ws/{key}`, `/http-tunnel/...` and
//! `/proxy/...` are recognized anywhere in the path (e.g. behind a
//! `/tunnel` prefix on an upstream rewrite), not only root-anchored. Every
//! other path is a public tunneled request.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{connect_info::ConnectInfo, FromRequestParts, State, WebSocketUpgrade},
    http::{Method, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tower::ServiceExt;
use tracing::{debug, warn};

use super::stream::PrefixedStream;
use super::{longpoll, proxy, public, socks, ws, GatewayState};

/// How many bytes are sniffed from a fresh connection.
pub const PEEK_WINDOW: usize = 16;

/// How long a fresh connection may stall before producing them.
pub const PEEK_DEADLINE: Duration = Duration::from_secs(5);

/// First byte of every SOCKS5 greeting.
const SOCKS5_VERSION_BYTE: u8 = 0x05;

/// Where an HTTP request is routed.
#[derive(Debug, PartialEq, Eq)]
pub enum Route<'a> {
    /// Persistent-transport registration: `.../ws/{key}`.
    RegisterAgent { key: &'a str },
    /// Long-poll transport: `.../http-tunnel/{op}/{key}`.
    LongPoll { op: LongPollOp, key: &'a str },
    /// Forward proxy: `.../proxy/{host}:{port}/{path}`.
    Proxy { target: &'a str, path: &'a str },
    /// Anything else: a public tunneled request.
    Public,
    /// Recognizably a special path, but malformed.
    BadRequest(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongPollOp {
    Register,
    Poll,
    Response,
}

/// Classify a request path.
pub fn classify(path: &str) -> Route<'_> {
    if let Some(i) = path.find("/ws/") {
        return Route::RegisterAgent {
            key: &path[i + "/ws/".len()..],
        };
    }

    if let Some(i) = path.find("/http-tunnel/") {
        let rest = &path[i + "/http-tunnel/".len()..];
        let Some((op, key)) = rest.split_once('/') else {
            return Route::BadRequest(
                "Invalid HTTP tunnel path format. Use: /http-tunnel/{operation}/{key}",
            );
        };
        let op = match op {
            "register" => LongPollOp::Register,
            "poll" => LongPollOp::Poll,
            "response" => LongPollOp::Response,
            _ => return Route::BadRequest("Invalid operation. Use: register, poll, or response"),
        };
        return Route::LongPoll { op, key };
    }

    if let Some(i) = path.find("/proxy/") {
        let rest = &path[i + "/proxy/".len()..];
        let (target, path) = rest.split_once('/').unwrap_or((rest, ""));
        if target.is_empty() {
            return Route::BadRequest("Invalid proxy path format. Use: /proxy/host:port/path");
        }
        return Route::Proxy { target, path };
    }

    Route::Public
}

/// Top-level axum handler: every request lands here and is fanned out by
/// [`classify`].
pub async fn route_request(
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let path = req.uri().path().to_string();
    let (mut parts, body) = req.into_parts();
    match classify(&path) {
        Route::RegisterAgent { key } => {
            let Ok(upgrade) = WebSocketUpgrade::from_request_parts(&mut parts, &state).await
            else {
                return (StatusCode::BAD_REQUEST, "WebSocket upgrade required").into_response();
            };
            ws::register(state, key.to_string(), addr, upgrade)
        }
        Route::LongPoll { op, key } => {
            if key.is_empty() {
                return (StatusCode::BAD_REQUEST, "Tunnel key cannot be empty").into_response();
            }
            match op {
                LongPollOp::Register => {
                    if parts.method != Method::POST {
                        return method_not_allowed("POST");
                    }
                    longpoll::register(&state, key, addr).await
                }
                LongPollOp::Poll => {
                    if parts.method != Method::GET {
                        return method_not_allowed("GET");
                    }
                    longpoll::poll(&state, key).await
                }
                LongPollOp::Response => {
                    if parts.method != Method::POST {
                        return method_not_allowed("POST");
                    }
                    let req = Request::from_parts(parts, body);
                    longpoll::response(&state, key, req).await
                }
            }
        }
        Route::Proxy { target, path } => {
            let req = Request::from_parts(parts, body);
            proxy::handle(&state, addr, target, path, req).await
        }
        Route::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
        Route::Public => {
            let req = Request::from_parts(parts, body);
            public::handle(&state, addr, req).await
        }
    }
}

fn method_not_allowed(expected: &'static str) -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Method not allowed. Use {expected}"),
    )
        .into_response()
}

/// Detect the protocol on a freshly accepted (and possibly TLS-unwrapped)
/// connection, then hand it to the right stack with the sniffed bytes
/// replayed in front.
pub async fn serve_connection<S>(mut stream: S, remote_addr: SocketAddr, router: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut buf = [0u8; PEEK_WINDOW];
    let n = match tokio::time::timeout(PEEK_DEADLINE, stream.read(&mut buf)).await {
        Ok(Ok(0)) => return,
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!(remote_addr = %remote_addr, error = %e, "failed to read protocol bytes");
            return;
        }
        Err(_) => {
            debug!(remote_addr = %remote_addr, "no protocol bytes within deadline");
            return;
        }
    };

    let prefix = Bytes::copy_from_slice(&buf[..n]);
    if prefix[0] == SOCKS5_VERSION_BYTE {
        debug!(remote_addr = %remote_addr, "detected SOCKS5 protocol");
        let stream = PrefixedStream::new(prefix, stream);
        if let Err(e) = socks::handle(stream, remote_addr).await {
            debug!(remote_addr = %remote_addr, error = %e, "SOCKS5 session ended with error");
        }
        return;
    }

    debug!(remote_addr = %remote_addr, "detected HTTP protocol");
    let io = TokioIo::new(PrefixedStream::new(prefix, stream));
    let service = hyper::service::service_fn(move |mut req: Request<hyper::body::Incoming>| {
        let router = router.clone();
        req.extensions_mut().insert(ConnectInfo(remote_addr));
        async move {
            let resp = router
                .oneshot(req.map(Body::new))
                .await
                .expect("axum router is infallible");
            Ok::<_, std::convert::Infallible>(resp)
        }
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        // Clients dropping keep-alive connections land here; only worth a whisper.
        let msg = e.to_string();
        if msg.contains("connection closed") || msg.contains("connection reset") {
            debug!(remote_addr = %remote_addr, "HTTP connection closed");
        } else {
            warn!(remote_addr = %remote_addr, error = %e, "HTTP connection error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_anchored_forms() {
        assert_eq!(classify("/ws/alpha"), Route::RegisterAgent { key: "alpha" });
        assert_eq!(
            classify("/http-tunnel/register/gamma"),
            Route::LongPoll {
                op: LongPollOp::Register,
                key: "gamma"
            }
        );
        assert_eq!(
            classify("/http-tunnel/poll/gamma"),
            Route::LongPoll {
                op: LongPollOp::Poll,
                key: "gamma"
            }
        );
        assert_eq!(
            classify("/http-tunnel/response/gamma"),
            Route::LongPoll {
                op: LongPollOp::Response,
                key: "gamma"
            }
        );
        assert_eq!(
            classify("/proxy/10.0.0.2:8080/api/v1"),
            Route::Proxy {
                target: "10.0.0.2:8080",
                path: "api/v1"
            }
        );
    }

    #[test]
    fn test_nested_prefixes_are_accepted() {
        assert_eq!(
            classify("/tunnel/ws/alpha"),
            Route::RegisterAgent { key: "alpha" }
        );
        assert_eq!(
            classify("/edge/http-tunnel/poll/k"),
            Route::LongPoll {
                op: LongPollOp::Poll,
                key: "k"
            }
        );
        assert_eq!(
            classify("/edge/proxy/host:80/x"),
            Route::Proxy {
                target: "host:80",
                path: "x"
            }
        );
    }

    #[test]
    fn test_everything_else_is_public() {
        assert_eq!(classify("/"), Route::Public);
        assert_eq!(classify("/hello"), Route::Public);
        assert_eq!(classify("/api/wslike"), Route::Public);
        assert_eq!(classify("/websocket"), Route::Public);
    }

    #[test]
    fn test_malformed_special_paths() {
        assert!(matches!(
            classify("/http-tunnel/register"),
            Route::BadRequest(_)
        ));
        assert!(matches!(
            classify("/http-tunnel/frobnicate/k"),
            Route::BadRequest(_)
        ));
        assert!(matches!(classify("/proxy/"), Route::BadRequest(_)));
    }

    #[test]
    fn test_empty_ws_key_still_routes_to_register() {
        // The handler owns the 400; classification just extracts the key.
        assert_eq!(classify("/ws/"), Route::RegisterAgent { key: "" });
    }

    #[test]
    fn test_proxy_without_subpath() {
        assert_eq!(
            classify("/proxy/example.com:9000"),
            Route::Proxy {
                target: "example.com:9000",
                path: ""
            }
        );
    }
}
