//! The gateway: one TCP port serving reverse HTTP tunnels, SOCKS5, and a
//! path-based forward proxy.
//!
//! Connection flow: accept → optional TLS unwrap → protocol peek
//! ([`dispatch`]) → SOCKS5 ([`socks`]) or per-connection HTTP serving of
//! the router, whose single fallback handler fans out to agent
//! registration ([`ws`], [`longpoll`]), the forward proxy ([`proxy`]), or
//! the public tunneled-request path ([`public`]).
//!
//! Shared state is deliberately small: the tunnel registry, the
//! pending-request table, and the two admission limiters, each behind its
//! own lock.

pub mod dispatch;
pub mod limit;
pub mod longpoll;
pub mod pending;
pub mod proxy;
pub mod public;
pub mod registry;
pub mod socks;
pub mod stream;
pub mod tls;
pub mod ws;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use self::limit::AdmissionLimiter;
use self::pending::PendingTable;
use self::registry::TunnelRegistry;

/// Shared gateway state, cloned into every handler.
#[derive(Clone)]
pub struct GatewayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Tunnel key → active agent endpoint.
    pub registry: Arc<TunnelRegistry>,
    /// In-flight public requests awaiting agent frames.
    pub pending: Arc<PendingTable>,
    /// Per-client-IP admission.
    pub ip_limiter: Arc<AdmissionLimiter>,
    /// Per-tunnel-key admission.
    pub key_limiter: Arc<AdmissionLimiter>,
    /// Outbound client for the forward proxy.
    pub http_client: reqwest::Client,
    /// Monotonic instant when the gateway started.
    pub start_time: Instant,
}

impl GatewayState {
    pub fn new(config: Arc<Config>) -> Self {
        let pending = Arc::new(PendingTable::new());
        Self {
            registry: Arc::new(TunnelRegistry::new(Arc::clone(&pending))),
            pending,
            ip_limiter: Arc::new(AdmissionLimiter::new(config.server.ip_rate_limit)),
            key_limiter: Arc::new(AdmissionLimiter::new(config.server.key_rate_limit)),
            http_client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds"),
            start_time: Instant::now(),
            config,
        }
    }
}

/// Run the gateway until ctrl-c / SIGTERM.
pub async fn run(config: Config) {
    let config = Arc::new(config);
    let state = GatewayState::new(Arc::clone(&config));

    let tls_acceptor = match (&config.server.cert_file, &config.server.key_file) {
        (Some(cert), Some(key)) => {
            Some(tls::build_acceptor(cert, key).expect("Failed to load TLS certificate"))
        }
        _ => None,
    };

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .expect("Failed to bind");
    info!(
        listen = %config.server.listen,
        tls = tls_acceptor.is_some(),
        "gateway listening"
    );
    info!("serving HTTP/WebSocket tunnels, long-poll tunnels, SOCKS5, and path proxy on one port");

    let router: Router = Router::new()
        .fallback(dispatch::route_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let reaper = longpoll::spawn_reaper(Arc::clone(&state.registry));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!(remote_addr = %remote_addr, "connection accepted");
                        let _ = stream.set_nodelay(true);
                        let acceptor = tls_acceptor.clone();
                        let router = router.clone();
                        tokio::spawn(async move {
                            match acceptor {
                                Some(acceptor) => match acceptor.accept(stream).await {
                                    Ok(tls_stream) => {
                                        dispatch::serve_connection(tls_stream, remote_addr, router)
                                            .await;
                                    }
                                    Err(e) => {
                                        debug!(remote_addr = %remote_addr, error = %e, "TLS handshake failed");
                                    }
                                },
                                None => dispatch::serve_connection(stream, remote_addr, router).await,
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                }
            }
        }
    }

    info!("shutting down");
    reaper.abort();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("received SIGINT");
    }
}
