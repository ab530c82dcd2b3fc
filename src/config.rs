//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **CLI flags** — applied by `main` after loading
//! 2. **Environment variables** — `ONEPORT_LISTEN`, `ONEPORT_KEY`,
//!    `ONEPORT_SERVER_URL`, `ONEPORT_TARGET_ADDR`
//! 3. **Config file** — path via `--config <path>`, or `oneport.toml` in CWD
//! 4. **Compiled defaults** — see each field's default below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:443"
//! cert_file = "/etc/oneport/cert.pem"   # omit both for plaintext TCP
//! key_file = "/etc/oneport/key.pem"
//! ip_rate_limit = 0                     # requests/sec per IP, 0 = unlimited
//! key_rate_limit = 0                    # requests/sec per tunnel key
//!
//! [client]
//! server_url = "wss://gateway.example.com"   # http(s):// for --longpoll
//! target_addr = "127.0.0.1:8080"
//! key = "default"
//! insecure = false
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:443`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// PEM certificate chain; TLS is enabled only when both paths are set.
    pub cert_file: Option<String>,
    /// PEM private key.
    pub key_file: Option<String>,
    /// Admitted requests/sec per client IP, burst 2×. 0 disables (default).
    #[serde(default)]
    pub ip_rate_limit: u32,
    /// Admitted requests/sec per tunnel key, burst 2×. 0 disables (default).
    #[serde(default)]
    pub key_rate_limit: u32,
}

/// Agent-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Gateway URL: `ws(s)://…` for the persistent transport,
    /// `http(s)://…` for long-poll.
    #[serde(default)]
    pub server_url: String,
    /// Local service requests are forwarded to, e.g. `127.0.0.1:8080`.
    #[serde(default)]
    pub target_addr: String,
    /// Tunnel key this agent serves (default `"default"`).
    #[serde(default = "default_key")]
    pub key: String,
    /// Skip TLS certificate verification when dialing the gateway.
    #[serde(default)]
    pub insecure: bool,
    /// Use the long-poll transport instead of the persistent one.
    #[serde(default)]
    pub longpoll: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:443".to_string()
}
fn default_key() -> String {
    "default".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            cert_file: None,
            key_file: None,
            ip_rate_limit: 0,
            key_rate_limit: 0,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            target_addr: String::new(),
            key: default_key(),
            insecure: false,
            longpoll: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file >
    /// defaults. CLI flags are layered on top by the caller.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `oneport.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("oneport.toml").exists() {
            let content =
                std::fs::read_to_string("oneport.toml").expect("Failed to read oneport.toml");
            toml::from_str(&content).expect("Failed to parse oneport.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("ONEPORT_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(key) = std::env::var("ONEPORT_KEY") {
            config.client.key = key;
        }
        if let Ok(url) = std::env::var("ONEPORT_SERVER_URL") {
            config.client.server_url = url;
        }
        if let Ok(target) = std::env::var("ONEPORT_TARGET_ADDR") {
            config.client.target_addr = target;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, "0.0.0.0:443");
        assert_eq!(config.server.ip_rate_limit, 0);
        assert_eq!(config.server.key_rate_limit, 0);
        assert!(config.server.cert_file.is_none());
        assert_eq!(config.client.key, "default");
        assert!(!config.client.longpoll);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            ip_rate_limit = 5

            [client]
            server_url = "wss://gw.example.com"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert_eq!(config.server.ip_rate_limit, 5);
        assert_eq!(config.server.key_rate_limit, 0);
        assert_eq!(config.client.server_url, "wss://gw.example.com");
        assert_eq!(config.client.key, "default");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_tls_paths_deserialize() {
        let config: Config = toml::from_str(
            r#"
            [server]
            cert_file = "/tmp/cert.pem"
            key_file = "/tmp/key.pem"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.cert_file.as_deref(), Some("/tmp/cert.pem"));
        assert_eq!(config.server.key_file.as_deref(), Some("/tmp/key.pem"));
    }
}
