//! oneport entry point.
//!
//! Two modes, selected by subcommand:
//!
//! - `oneport server` — run the public-facing gateway
//! - `oneport client` — run the agent inside the private network
//!
//! Each mode loads `oneport.toml` (or `--config <path>`), applies
//! `ONEPORT_*` env vars, then its own flags on top.

use clap::{Parser, Subcommand};
use tracing::info;

use oneport::config::Config;

/// Single-port multi-protocol gateway and tunnel agent.
#[derive(Parser)]
#[command(name = "oneport", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the public-facing gateway.
    Server {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Socket address to listen on, e.g. `0.0.0.0:443`.
        #[arg(long)]
        listen: Option<String>,
        /// TLS certificate chain (PEM). Enables TLS together with --key-file.
        #[arg(long)]
        cert: Option<String>,
        /// TLS private key (PEM).
        #[arg(long)]
        key_file: Option<String>,
        /// Admitted requests/sec per client IP (0 = unlimited).
        #[arg(long)]
        ip_rate_limit: Option<u32>,
        /// Admitted requests/sec per tunnel key (0 = unlimited).
        #[arg(long)]
        key_rate_limit: Option<u32>,
    },
    /// Run the agent: dial the gateway and forward requests to a local target.
    Client {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
        /// Gateway URL, e.g. `wss://gateway.example.com` (or `https://…` with --longpoll).
        #[arg(long)]
        server: Option<String>,
        /// Local service to forward to, e.g. `127.0.0.1:8080`.
        #[arg(long)]
        target: Option<String>,
        /// Tunnel key identifying this service.
        #[arg(long)]
        key: Option<String>,
        /// Skip TLS certificate verification.
        #[arg(long)]
        insecure: bool,
        /// Use the HTTP long-poll transport instead of WebSocket.
        #[arg(long)]
        longpoll: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            config,
            listen,
            cert,
            key_file,
            ip_rate_limit,
            key_rate_limit,
        } => {
            let mut config = Config::load(config.as_deref());
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(cert) = cert {
                config.server.cert_file = Some(cert);
            }
            if let Some(key_file) = key_file {
                config.server.key_file = Some(key_file);
            }
            if let Some(limit) = ip_rate_limit {
                config.server.ip_rate_limit = limit;
            }
            if let Some(limit) = key_rate_limit {
                config.server.key_rate_limit = limit;
            }

            init_tracing(&config);
            info!("oneport v{} starting in server mode", env!("CARGO_PKG_VERSION"));
            oneport::server::run(config).await;
        }
        Commands::Client {
            config,
            server,
            target,
            key,
            insecure,
            longpoll,
        } => {
            let mut config = Config::load(config.as_deref());
            if let Some(server) = server {
                config.client.server_url = server;
            }
            if let Some(target) = target {
                config.client.target_addr = target;
            }
            if let Some(key) = key {
                config.client.key = key;
            }
            if insecure {
                config.client.insecure = true;
            }
            if longpoll {
                config.client.longpoll = true;
            }

            if config.client.server_url.is_empty() || config.client.target_addr.is_empty() {
                eprintln!("error: client mode requires --server and --target");
                std::process::exit(2);
            }
            let scheme_ok = if config.client.longpoll {
                config.client.server_url.starts_with("http://")
                    || config.client.server_url.starts_with("https://")
            } else {
                config.client.server_url.starts_with("ws://")
                    || config.client.server_url.starts_with("wss://")
            };
            if !scheme_ok {
                eprintln!(
                    "error: server URL must be ws(s):// for the persistent transport or http(s):// with --longpoll"
                );
                std::process::exit(2);
            }

            init_tracing(&config);
            info!("oneport v{} starting in client mode", env!("CARGO_PKG_VERSION"));
            let client_config = config.client.clone();
            if client_config.longpoll {
                oneport::client::longpoll::run(client_config).await;
            } else {
                oneport::client::run(client_config).await;
            }
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
