#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]

//! # oneport
//!
//! A single-port, multi-protocol gateway. Services behind NAT or firewalls
//! run the agent (`oneport client`), which dials out to the public gateway
//! (`oneport server`) and registers a named tunnel; the gateway then routes
//! public HTTP requests to the right agent and streams the responses back.
//! The same port also answers SOCKS5 and serves a path-based forward proxy.
//!
//! ## HTTP surface (gateway)
//!
//! | Method | Path (suffix match)             | Description                        |
//! |--------|---------------------------------|------------------------------------|
//! | GET    | `/ws/{key}`                     | Agent WebSocket registration       |
//! | POST   | `/http-tunnel/register/{key}`   | Long-poll agent registration       |
//! | GET    | `/http-tunnel/poll/{key}`       | Long-poll: fetch one frame         |
//! | POST   | `/http-tunnel/response/{key}`   | Long-poll: deliver one frame       |
//! | any    | `/proxy/{host}:{port}/{path}`   | Forward proxy to `host:port`       |
//! | any    | anything else                   | Public request, tunneled by key    |
//!
//! Public requests pick their tunnel with the `X-Tunnel-Key` header
//! (missing or empty means `"default"`). Connections whose first byte is
//! `0x05` are served as SOCKS5 instead of HTTP.
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, tracing init
//! config.rs        — TOML + env-var + flag configuration
//! protocol/
//!   mod.rs         — TunnelFrame codec (id/kind/payload, big-endian)
//!   http.rs        — raw HTTP/1.1 wire forms used as frame payloads
//! server/
//!   mod.rs         — GatewayState, listener loop, TLS wrap, shutdown
//!   dispatch.rs    — protocol peek (SOCKS5 vs HTTP) + path routing
//!   stream.rs      — replay adapter for peeked bytes
//!   public.rs      — public request: admit, dispatch, stream response
//!   ws.rs          — persistent agent transport (reader/writer pair)
//!   longpoll.rs    — long-poll endpoints + inactivity reaper
//!   registry.rs    — tunnel key → agent endpoint, replacement semantics
//!   pending.rs     — in-flight request table, per-request sinks
//!   limit.rs       — per-IP / per-key token buckets
//!   proxy.rs       — forward proxy collaborator
//!   socks.rs       — SOCKS5 CONNECT collaborator
//!   tls.rs         — rustls acceptor from PEM files
//! client/
//!   mod.rs         — persistent agent: reconnect loop, single writer
//!   longpoll.rs    — long-poll agent: register/poll/response loop
//!   forward.rs     — local-target fetch shared by both transports
//! ```

pub mod client;
pub mod config;
pub mod protocol;
pub mod server;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use protocol::TunnelFrame;
pub use server::GatewayState;
