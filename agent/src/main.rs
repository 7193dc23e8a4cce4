#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portway
//!
//! Tunnel agent for the portway relay. Opens persistent outbound WebSocket
//! sessions to a relay and bridges proxied public traffic to services on
//! the local network.
//!
//! ## Subcommands
//!
//! - `portway relay` — heartbeat-only session (connectivity check)
//! - `portway http --subdomain app --local http://localhost:8081`
//! - `portway tcp --external-port 25000 --local-port 22`
//! - `portway udp --external-port 40000 --local-port 53`
//! - `portway start --config portway-agent.toml` — run every configured
//!   tunnel with automatic reconnect
//!
//! ## Architecture
//!
//! ```text
//! main.rs    — clap subcommands, reconnect loop, ctrl-c handling
//! config.rs  — TOML tunnel configuration for `start`
//! client.rs  — dial, multiplex session, hello/heartbeat, dispatch
//! http.rs    — proxied HTTP exchange + WebSocket pass-through
//! tcp.rs     — proxied TCP connection bridging
//! udp.rs     — proxied datagram flows
//! ```

mod client;
mod config;
mod http;
mod tcp;
mod udp;

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use client::{ClientConfig, RelayClient};
use config::{Config, Tunnel};

/// Reconnect backoff starts here and doubles per attempt.
const BACKOFF_START: Duration = Duration::from_secs(2);
/// Reconnect backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Tunnel agent for the portway relay.
#[derive(Parser)]
#[command(name = "portway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct ConnectionArgs {
    /// Relay WebSocket URL.
    #[arg(long, env = "PORTWAY_RELAY_URL", default_value = "ws://localhost:8080/relay")]
    url: String,
    /// Relay token.
    #[arg(long, env = "PORTWAY_RELAY_TOKEN", default_value = "")]
    token: String,
    /// Client id (fresh UUID when empty).
    #[arg(long, default_value = "")]
    client_id: String,
    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 10)]
    heartbeat_secs: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Heartbeat-only relay session.
    Relay {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Expose a local HTTP origin under a subdomain.
    Http {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Subdomain to register.
        #[arg(long)]
        subdomain: String,
        /// Comma-separated allowlist CIDRs.
        #[arg(long, default_value = "")]
        allow: String,
        /// Local base URL to proxy to.
        #[arg(long, env = "PORTWAY_LOCAL_URL", default_value = "http://localhost:8081")]
        local: String,
    },
    /// Expose a local TCP service on a reserved external port.
    Tcp {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// External TCP port to reserve.
        #[arg(long)]
        external_port: u16,
        /// Local host to dial.
        #[arg(long, env = "PORTWAY_LOCAL_HOST", default_value = "localhost")]
        local_host: String,
        /// Local port to dial.
        #[arg(long, env = "PORTWAY_LOCAL_PORT", default_value_t = 8081)]
        local_port: u16,
    },
    /// Expose a local UDP service on a reserved external port.
    Udp {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// External UDP port to reserve.
        #[arg(long)]
        external_port: u16,
        /// Local host to dial.
        #[arg(long, env = "PORTWAY_LOCAL_HOST", default_value = "localhost")]
        local_host: String,
        /// Local port to dial.
        #[arg(long, env = "PORTWAY_LOCAL_PORT", default_value_t = 8081)]
        local_port: u16,
    },
    /// Run every tunnel from a config file, reconnecting on failure.
    Start {
        /// Path to TOML config file.
        #[arg(long, env = "PORTWAY_CONFIG")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Relay { conn } => {
            let client = RelayClient::new(client_config(&conn, String::new(), String::new(), 0));
            run_until_cancelled(async move {
                if let Err(e) = client.run_relay().await {
                    error!("relay session failed: {e}");
                }
            })
            .await;
        }
        Commands::Http {
            conn,
            subdomain,
            allow,
            local,
        } => {
            if subdomain.trim().is_empty() {
                error!("subdomain is required");
                std::process::exit(1);
            }
            let allowlist = split_allowlist(&allow);
            let client = RelayClient::new(client_config(&conn, local, String::new(), 0));
            run_until_cancelled(async move {
                if let Err(e) = client.run_http(subdomain.trim(), allowlist).await {
                    error!("http tunnel failed: {e}");
                }
            })
            .await;
        }
        Commands::Tcp {
            conn,
            external_port,
            local_host,
            local_port,
        } => {
            let client =
                RelayClient::new(client_config(&conn, String::new(), local_host, local_port));
            run_until_cancelled(async move {
                if let Err(e) = client.run_tcp(external_port).await {
                    error!("tcp tunnel failed: {e}");
                }
            })
            .await;
        }
        Commands::Udp {
            conn,
            external_port,
            local_host,
            local_port,
        } => {
            let client =
                RelayClient::new(client_config(&conn, String::new(), local_host, local_port));
            run_until_cancelled(async move {
                if let Err(e) = client.run_udp(external_port).await {
                    error!("udp tunnel failed: {e}");
                }
            })
            .await;
        }
        Commands::Start { config } => run_start(&config).await,
    }
}

fn client_config(
    conn: &ConnectionArgs,
    local_base_url: String,
    local_host: String,
    local_port: u16,
) -> ClientConfig {
    ClientConfig {
        url: conn.url.clone(),
        token: conn.token.trim().to_string(),
        client_id: conn.client_id.clone(),
        heartbeat: Duration::from_secs(conn.heartbeat_secs),
        local_base_url,
        local_host,
        local_port,
    }
}

fn split_allowlist(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Run `task` until it finishes or ctrl-c arrives.
async fn run_until_cancelled(task: impl std::future::Future<Output = ()>) {
    tokio::select! {
        () = task => {}
        _ = tokio::signal::ctrl_c() => info!("interrupted, shutting down"),
    }
}

async fn run_start(config_path: &str) {
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("config load failed: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        error!("config invalid: {e}");
        std::process::exit(1);
    }

    info!(
        tunnels = config.tunnels.len(),
        relay = %config.relay_url,
        "starting configured tunnels"
    );

    let mut tasks = Vec::new();
    for tunnel in config.tunnels.clone() {
        let config = config.clone();
        tasks.push(tokio::spawn(async move {
            run_tunnel_loop(&config, &tunnel).await;
        }));
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("interrupted, shutting down");
    for task in &tasks {
        task.abort();
    }
}

/// One tunnel's lifetime: connect, serve, and on any non-cancellation
/// disconnect retry with exponential backoff (2 s doubling to a 30 s cap).
async fn run_tunnel_loop(config: &Config, tunnel: &Tunnel) {
    let mut backoff = BACKOFF_START;
    loop {
        let client = RelayClient::new(ClientConfig {
            url: config.relay_url.clone(),
            token: config.token.clone(),
            client_id: String::new(),
            heartbeat: Duration::from_secs(10),
            local_base_url: tunnel.local_url.clone(),
            local_host: tunnel.local_host.clone(),
            local_port: tunnel.local_port,
        });

        let result = match tunnel.protocol.trim().to_lowercase().as_str() {
            "http" => client.run_http(tunnel.subdomain.trim(), tunnel.allowlist.clone()).await,
            "tcp" => client.run_tcp(tunnel.external_port).await,
            "udp" => client.run_udp(tunnel.external_port).await,
            other => {
                error!(tunnel = %tunnel.name, protocol = other, "unknown protocol");
                return;
            }
        };

        match result {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    tunnel = %tunnel.name,
                    "tunnel disconnected: {e}, reconnecting in {}s",
                    backoff.as_secs()
                );
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}
