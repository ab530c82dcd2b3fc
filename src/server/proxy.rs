//! Path-based forward proxy: `/proxy/{host}:{port}/{path}`.
//!
//! Unlike tunneled requests, proxy requests never touch the registry: the
//! gateway fetches the target directly and relays the response. Only the
//! per-IP limiter applies.

use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, info, warn};

use super::public::client_ip;
use super::GatewayState;
use crate::protocol::http::is_hop_by_hop;

/// Build the target URL for a proxy request. A bare host gets the default
/// HTTP port.
fn target_url(target: &str, path: &str, query: Option<&str>) -> String {
    let authority = if target.contains(':') {
        target.to_string()
    } else {
        format!("{target}:80")
    };
    match query {
        Some(q) => format!("http://{authority}/{path}?{q}"),
        None => format!("http://{authority}/{path}"),
    }
}

pub async fn handle(
    state: &GatewayState,
    remote_addr: SocketAddr,
    target: &str,
    path: &str,
    req: Request<Body>,
) -> Response {
    let ip = client_ip(req.headers(), remote_addr);
    if !state.ip_limiter.allow(&ip.to_string()) {
        warn!(client_ip = %ip, target, "IP rate limited for proxy request");
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests from your IP").into_response();
    }

    let url = target_url(target, path, req.uri().query());
    debug!(client_ip = %ip, url = %url, method = %req.method(), "forward proxy request");

    let (parts, body) = req.into_parts();
    let mut outbound = state.http_client.request(parts.method.clone(), &url);
    for (name, value) in &parts.headers {
        if is_hop_by_hop(name.as_str()) || name == header::HOST {
            continue;
        }
        outbound = outbound.header(name, value);
    }
    outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = match outbound.send().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(client_ip = %ip, url = %url, error = %e, "failed to reach proxy target");
            return (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response();
        }
    };

    info!(
        client_ip = %ip,
        target,
        status = %upstream.status(),
        "forward proxy response"
    );

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_with_explicit_port() {
        assert_eq!(
            target_url("10.0.0.2:8080", "api/v1", None),
            "http://10.0.0.2:8080/api/v1"
        );
    }

    #[test]
    fn test_target_url_defaults_to_port_80() {
        assert_eq!(target_url("example.com", "", None), "http://example.com:80/");
    }

    #[test]
    fn test_target_url_keeps_query() {
        assert_eq!(
            target_url("h:1", "p", Some("a=1&b=2")),
            "http://h:1/p?a=1&b=2"
        );
    }
}
