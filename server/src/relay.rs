//! Relay control plane — accepts agent sessions and binds registrations.
//!
//! Each agent keeps one outbound WebSocket to `/relay`. The handler:
//! 1. Checks that a token source exists (store or static fallback)
//! 2. Upgrades with the "binary" subprotocol and starts a multiplex session
//! 3. Accepts the control sub-stream and reads the hello
//! 4. Authenticates, answers `hello_ok` or `error`
//! 5. Binds the registration (registry + reservation + proxy listener)
//! 6. Consumes heartbeats until timeout, read error, or agent close
//! 7. Tears down exactly the bindings this session created

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::DateTime;
use portway_proto::frames::{read_json, write_json};
use portway_proto::messages::{
    ControlMessage, Hello, TunnelProtocol, ERR_REGISTRATION_FAILED, ERR_UNAUTHORIZED,
};
use portway_proto::mux::{self, Mode, MuxHandle, MuxStream};
use portway_proto::ws::WsByteStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::store::{HttpReservation, PortReservation, TunnelRecord};
use crate::AppState;

/// A silent agent is dropped after this long without a heartbeat.
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /relay` — agent WebSocket registration endpoint.
pub async fn relay_ws(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    // A session can only be authenticated if some token source exists.
    match state.store.has_active_token() {
        Ok(true) => {}
        Ok(false) => {
            if state.config.relay.token.trim().is_empty() {
                return (StatusCode::SERVICE_UNAVAILABLE, "relay token not configured")
                    .into_response();
            }
        }
        Err(e) => {
            warn!("relay token lookup failed: {e}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "relay token lookup failed")
                .into_response();
        }
    }

    ws.protocols(["binary"]).on_upgrade(move |socket| {
        handle_session(state, socket, remote).instrument(info_span!("relay_session", %remote))
    })
}

/// What this session bound, to be undone on teardown.
#[derive(Default)]
struct Binding {
    tunnel_id: String,
    subdomain: Option<String>,
    tcp_port: Option<u16>,
    udp_port: Option<u16>,
}

async fn handle_session(state: AppState, socket: WebSocket, remote: SocketAddr) {
    let transport = WsByteStream::<_, Message>::new(socket);
    let (session, mut incoming) = mux::spawn(transport, Mode::Server);

    let Some(mut control) = incoming.accept().await else {
        debug!("session ended before control sub-stream");
        return;
    };

    let hello = match read_json::<_, ControlMessage>(&mut control).await {
        Ok(ControlMessage::Hello(hello)) => hello,
        Ok(other) => {
            debug!(?other, "expected hello on control sub-stream");
            let _ = write_json(
                &mut control,
                &ControlMessage::error(ERR_UNAUTHORIZED, "invalid token"),
            )
            .await;
            return;
        }
        Err(e) => {
            debug!("hello read failed: {e}");
            return;
        }
    };

    if !authenticate(&state, &hello.token) {
        info!(client_id = %hello.client_id, "rejected hello: invalid token");
        let _ = write_json(
            &mut control,
            &ControlMessage::error(ERR_UNAUTHORIZED, "invalid token"),
        )
        .await;
        return;
    }

    if let Err(e) = write_json(
        &mut control,
        &ControlMessage::HelloOk {
            client_id: hello.client_id.clone(),
        },
    )
    .await
    {
        warn!(client_id = %hello.client_id, "hello_ok write failed: {e}");
        return;
    }

    let binding = match bind_registration(&state, &hello, &session).await {
        Ok(binding) => binding,
        Err(message) => {
            info!(client_id = %hello.client_id, %message, "registration failed");
            let _ = write_json(
                &mut control,
                &ControlMessage::error(ERR_REGISTRATION_FAILED, message),
            )
            .await;
            return;
        }
    };

    info!(
        client_id = %hello.client_id,
        protocol = hello.protocol.map_or("none", TunnelProtocol::as_str),
        "agent session bound"
    );

    // Only the server opens data sub-streams; anything the agent opens is
    // closed immediately.
    let consumer = tokio::spawn(async move {
        while let Some(stream) = incoming.accept().await {
            drop(stream);
        }
    });

    control_loop(&state, &hello, &mut control).await;

    consumer.abort();
    teardown(&state, &binding, session.session_id()).await;
    session.close().await;
    info!(client_id = %hello.client_id, "agent session closed");
}

/// Token check: the store is authoritative while it holds an active token;
/// the static config token is the fallback.
fn authenticate(state: &AppState, token: &str) -> bool {
    match state.store.has_active_token() {
        Ok(true) => state.store.validate_token(token).unwrap_or(false),
        Ok(false) => {
            let configured = state.config.relay.token.trim();
            !configured.is_empty() && token.trim() == configured
        }
        Err(e) => {
            warn!("token lookup failed during authentication: {e}");
            false
        }
    }
}

/// Bind the registration named by the hello. Registry state is
/// authoritative; reservation and tunnel upserts are best-effort.
async fn bind_registration(
    state: &AppState,
    hello: &Hello,
    session: &MuxHandle,
) -> Result<Binding, String> {
    let tunnel_id = hello.tunnel_id.clone().unwrap_or_default();
    let mut binding = Binding {
        tunnel_id: tunnel_id.clone(),
        ..Binding::default()
    };

    let Some(protocol) = hello.protocol else {
        // Heartbeat-only session: nothing to bind.
        return Ok(binding);
    };

    match protocol {
        TunnelProtocol::Http => {
            let subdomain = hello.subdomain.as_deref().unwrap_or("").trim();
            if subdomain.is_empty() {
                return Err("subdomain required".to_string());
            }
            state
                .registry
                .register_http(
                    &tunnel_id,
                    session.clone(),
                    subdomain,
                    hello.allowlist.clone(),
                )
                .map_err(|e| e.to_string())?;
            binding.subdomain = Some(subdomain.to_lowercase());

            if let Err(e) = state.store.upsert_http_reservation(&HttpReservation {
                tunnel_id: tunnel_id.clone(),
                subdomain: subdomain.to_lowercase(),
                allowlist: hello.allowlist.clone(),
            }) {
                warn!("persist http reservation failed: {e}");
            }
            persist_tunnel(state, hello, &tunnel_id, protocol);
        }
        TunnelProtocol::Tcp => {
            let port = hello.external_port.unwrap_or(0);
            if port == 0 {
                return Err("external port required".to_string());
            }
            state
                .registry
                .register_tcp(&tunnel_id, session.clone(), port)
                .map_err(|e| e.to_string())?;
            binding.tcp_port = Some(port);

            persist_port_reservation(state, "tcp", port, &tunnel_id);
            persist_tunnel(state, hello, &tunnel_id, protocol);
            if let Err(e) = state.tcp_proxy.ensure_listener(port).await {
                warn!(port, "tcp listener failed: {e}");
            }
        }
        TunnelProtocol::Udp => {
            let port = hello.external_port.unwrap_or(0);
            if port == 0 {
                return Err("external port required".to_string());
            }
            state
                .registry
                .register_udp(&tunnel_id, session.clone(), port)
                .map_err(|e| e.to_string())?;
            binding.udp_port = Some(port);

            persist_port_reservation(state, "udp", port, &tunnel_id);
            persist_tunnel(state, hello, &tunnel_id, protocol);
            if let Err(e) = state.udp_proxy.ensure_listener(port).await {
                warn!(port, "udp listener failed: {e}");
            }
        }
    }

    Ok(binding)
}

fn persist_port_reservation(state: &AppState, protocol: &str, port: u16, tunnel_id: &str) {
    if let Err(e) = state.store.upsert_port_reservation(&PortReservation {
        protocol: protocol.to_string(),
        external_port: port,
        tunnel_id: tunnel_id.to_string(),
        reserved: true,
        ..PortReservation::default()
    }) {
        warn!("persist port reservation failed: {e}");
    }
}

fn persist_tunnel(state: &AppState, hello: &Hello, tunnel_id: &str, protocol: TunnelProtocol) {
    if tunnel_id.is_empty() {
        return;
    }
    if let Err(e) = state.store.upsert_tunnel(&TunnelRecord {
        id: tunnel_id.to_string(),
        name: String::new(),
        protocol: protocol.to_string(),
        local_host: hello.local_host.clone().unwrap_or_default(),
        local_port: hello.local_port.unwrap_or(0),
        status: "active".to_string(),
        created_at: DateTime::UNIX_EPOCH,
        last_seen: DateTime::UNIX_EPOCH,
    }) {
        warn!("persist tunnel failed: {e}");
    }
}

/// Read control messages until the agent goes silent past the heartbeat
/// deadline, closes, or errors.
async fn control_loop(state: &AppState, hello: &Hello, control: &mut MuxStream) {
    loop {
        match tokio::time::timeout(HEARTBEAT_TIMEOUT, read_json::<_, ControlMessage>(control)).await
        {
            Err(_) => {
                warn!(client_id = %hello.client_id, "heartbeat timeout");
                return;
            }
            Ok(Err(e)) => {
                debug!(client_id = %hello.client_id, "control read ended: {e}");
                return;
            }
            Ok(Ok(ControlMessage::Heartbeat { timestamp })) => {
                debug!(client_id = %hello.client_id, %timestamp, "heartbeat");
                if let Some(tunnel_id) = hello.tunnel_id.as_deref() {
                    if let Err(e) = state.store.touch_tunnel(tunnel_id) {
                        debug!("tunnel last-seen update failed: {e}");
                    }
                }
            }
            Ok(Ok(other)) => {
                debug!(client_id = %hello.client_id, ?other, "unexpected control message");
            }
        }
    }
}

/// Undo this session's bindings. Entries are only removed while they still
/// belong to this session, so a reconnect that already re-bound the same
/// identifier is left untouched; listeners are released once no entry
/// claims the port.
async fn teardown(state: &AppState, binding: &Binding, session_id: u64) {
    if let Some(subdomain) = &binding.subdomain {
        if let Some(entry) = state.registry.lookup_http(subdomain) {
            if entry.session.session_id() == session_id {
                state.registry.remove_http(subdomain);
            }
        }
    }

    if let Some(port) = binding.tcp_port {
        if let Some(entry) = state.registry.lookup_tcp(port) {
            if entry.session.session_id() == session_id {
                state.registry.remove_tcp(port);
                state.tcp_proxy.remove_listener(port).await;
            }
        }
    }

    if let Some(port) = binding.udp_port {
        if let Some(entry) = state.registry.lookup_udp(port) {
            if entry.session.session_id() == session_id {
                state.registry.remove_udp(port);
                state.udp_proxy.remove_listener(port).await;
            }
        }
    }

    if !binding.tunnel_id.is_empty() {
        if let Err(e) = state.store.mark_tunnel_status(&binding.tunnel_id, "inactive") {
            debug!("mark tunnel inactive failed: {e}");
        }
    }
}
