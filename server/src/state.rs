//! Shared handler state and router assembly.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::metrics::{Collector, RollingLog};
use crate::proxy::tcp::TcpProxy;
use crate::proxy::udp::UdpProxy;
use crate::registry::Registry;
use crate::store::Store;

/// Shared state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Authoritative routing table for live tunnels.
    pub registry: Arc<Registry>,
    /// Durable reservations, tokens and observability data.
    pub store: Arc<Store>,
    /// In-memory per-tunnel counters.
    pub metrics: Arc<Collector>,
    /// Rolling log of recent proxied traffic.
    pub traffic_log: Arc<RollingLog>,
    /// Public TCP listener manager.
    pub tcp_proxy: Arc<TcpProxy>,
    /// Public UDP socket manager.
    pub udp_proxy: Arc<UdpProxy>,
}

impl AppState {
    /// Wire up the collaborators around an opened store.
    pub fn new(config: Config, store: Store) -> Self {
        let store = Arc::new(store);
        let registry = Arc::new(Registry::new());
        Self {
            metrics: Arc::new(Collector::new()),
            traffic_log: Arc::new(RollingLog::new(config.server.log_buffer)),
            tcp_proxy: TcpProxy::new(Arc::clone(&registry), Arc::clone(&store)),
            udp_proxy: UdpProxy::new(Arc::clone(&registry), Arc::clone(&store)),
            config: Arc::new(config),
            registry,
            store,
        }
    }
}

/// The public router: health probe, relay registration endpoint, and the
/// HTTP ingress proxy as the fallback for every other request.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/relay", get(crate::relay::relay_ws))
        .fallback(crate::proxy::http::ingress)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `GET /healthz` — liveness probe.
async fn healthz() -> &'static str {
    "ok"
}
