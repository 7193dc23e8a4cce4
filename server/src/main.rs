#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # portway-server
//!
//! Ingress reverse-tunnel relay. Public HTTP, TCP and UDP traffic is
//! forwarded over persistent outbound WebSocket sessions to portway agents
//! running behind NAT, which bridge to services on their private networks.
//!
//! ## Public surface
//!
//! | Method | Path          | Description                                         |
//! |--------|---------------|-----------------------------------------------------|
//! | GET    | `/healthz`    | Liveness probe, returns `ok`                        |
//! | GET    | `/relay`      | Agent WebSocket registration (subprotocol `binary`) |
//! | *      | anything else | Proxied into the tunnel matching the Host header    |
//!
//! Reserved TCP and UDP ports get their own listeners, started when an
//! agent registers and released when no tunnel claims them anymore.

use std::net::SocketAddr;
use std::path::Path;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{info, warn};

use portway_server::{state, AppState, Config, Store};

/// Ingress reverse-tunnel relay server.
#[derive(Parser)]
#[command(name = "portway-server", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("portway-server v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    // Store, migrations and token bootstrap are fatal conditions.
    let store = Store::open(Path::new(&config.server.db_path))
        .unwrap_or_else(|e| panic!("Failed to open store {}: {e}", config.server.db_path));
    store
        .apply_migrations(Path::new(&config.server.migrations_dir))
        .unwrap_or_else(|e| panic!("Failed to run migrations: {e}"));
    if let Err(e) = store.ensure_token(&config.relay.token) {
        panic!("Token init failed: {e} — set PORTWAY_RELAY_TOKEN or seed the token store");
    }
    if !config.relay.token.trim().is_empty() {
        warn!("Static relay token configured; prefer rotating stored tokens");
    }

    let state = AppState::new(config, store);
    let app = state::router(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .expect("Server error");

    info!("Shutting down...");
    state.tcp_proxy.shutdown().await;
    state.udp_proxy.shutdown().await;
    info!("Goodbye");
}
