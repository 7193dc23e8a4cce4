//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `PORTWAY_LISTEN`, `PORTWAY_DB_PATH`,
//!    `PORTWAY_MIGRATIONS_DIR`, `PORTWAY_RELAY_TOKEN`
//! 2. **Config file** — path via `--config <path>`, or `portway.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! db_path = "data/portway.db"
//! migrations_dir = "migrations"
//! trust_forwarded_headers = false
//! log_buffer = 1000
//!
//! [relay]
//! token = ""   # static fallback when the token store is empty
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
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener and storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// SQLite database path (default `data/portway.db`).
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Directory holding `*.sql` migration files (default `migrations`).
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: String,
    /// Honor the first `X-Forwarded-For` hop for allowlist admission.
    /// Enable only behind a trusted fronting proxy (default false).
    #[serde(default)]
    pub trust_forwarded_headers: bool,
    /// Entries kept in the in-memory rolling traffic log (default 1000).
    #[serde(default = "default_log_buffer")]
    pub log_buffer: usize,
}

/// Relay authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    /// Static fallback token, used only when the token store holds no
    /// active token. Override with `PORTWAY_RELAY_TOKEN`.
    #[serde(default)]
    pub token: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_db_path() -> String {
    "data/portway.db".to_string()
}
fn default_migrations_dir() -> String {
    "migrations".to_string()
}
fn default_log_buffer() -> usize {
    1000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            db_path: default_db_path(),
            migrations_dir: default_migrations_dir(),
            trust_forwarded_headers: false,
            log_buffer: default_log_buffer(),
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
    /// defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure — a broken
    /// config is a fatal startup condition). Otherwise looks for
    /// `portway.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("portway.toml").exists() {
            let content =
                std::fs::read_to_string("portway.toml").expect("Failed to read portway.toml");
            toml::from_str(&content).expect("Failed to parse portway.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("PORTWAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(db_path) = std::env::var("PORTWAY_DB_PATH") {
            config.server.db_path = db_path;
        }
        if let Ok(dir) = std::env::var("PORTWAY_MIGRATIONS_DIR") {
            config.server.migrations_dir = dir;
        }
        if let Ok(token) = std::env::var("PORTWAY_RELAY_TOKEN") {
            config.relay.token = token;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.migrations_dir, "migrations");
        assert!(!config.server.trust_forwarded_headers);
        assert!(config.relay.token.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_file_overrides() {
        let config: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:9000"
            trust_forwarded_headers = true

            [relay]
            token = "static-secret"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert!(config.server.trust_forwarded_headers);
        assert_eq!(config.relay.token, "static-secret");
        assert_eq!(config.server.db_path, "data/portway.db");
    }
}
