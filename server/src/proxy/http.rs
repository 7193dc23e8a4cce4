//! Public HTTP ingress.
//!
//! Every request that is not `/healthz` or `/relay` lands here. The Host
//! header picks the tunnel: the first label is looked up as a subdomain,
//! with enabled custom-domain mappings as the fallback route. Admitted
//! requests are serialized onto a fresh sub-stream as an envelope frame
//! plus one body frame; WebSocket upgrades switch to per-message framing
//! instead.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, FromRequestParts, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use portway_proto::frames::{read_frame, read_json, write_frame, write_json, MAX_FRAME_LEN};
use portway_proto::messages::{
    HttpRequestFrame, HttpResponseFrame, WS_MESSAGE_BINARY, WS_MESSAGE_TEXT,
};
use portway_proto::mux::MuxStream;
use tracing::{debug, warn};

use crate::allowlist::{client_addr, Allowlist};
use crate::metrics::TrafficEvent;
use crate::registry::HttpEntry;
use crate::store::LogEntry;
use crate::AppState;

/// Fallback handler proxying public HTTP traffic into tunnels.
pub async fn ingress(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let (mut parts, body) = request.into_parts();
    let ws = if is_websocket_request(&parts.headers) {
        WebSocketUpgrade::from_request_parts(&mut parts, &state)
            .await
            .ok()
    } else {
        None
    };
    let request = Request::from_parts(parts, body);

    let full_host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_lowercase)
        .or_else(|| request.uri().host().map(str::to_lowercase))
        .unwrap_or_default();
    let host = strip_port(&full_host);

    if host.starts_with("admin.") || host.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }

    let Some(entry) = resolve_route(&state, host) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let allow = match Allowlist::parse(&entry.allowlist) {
        Ok(allow) => allow,
        Err(e) => {
            warn!(subdomain = %entry.subdomain, "allowlist unparseable: {e}");
            return (StatusCode::FORBIDDEN, "forbidden").into_response();
        }
    };
    let remote_str = remote.to_string();
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok());
    let caller = client_addr(
        &remote_str,
        forwarded,
        state.config.server.trust_forwarded_headers,
    );
    if !allow.allows(caller) {
        return (StatusCode::FORBIDDEN, "forbidden").into_response();
    }

    let mut stream = match entry.session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(subdomain = %entry.subdomain, "sub-stream open failed: {e}");
            return (StatusCode::BAD_GATEWAY, "relay unavailable").into_response();
        }
    };

    let envelope = HttpRequestFrame {
        method: request.method().to_string(),
        path: request
            .uri()
            .path_and_query()
            .map_or_else(|| "/".to_string(), ToString::to_string),
        host: full_host.clone(),
        header: header_map_to_wire(request.headers()),
        remote_addr: remote_str.clone(),
        is_websocket: is_websocket_request(request.headers()),
    };
    let method = envelope.method.clone();
    let path_only = request.uri().path().to_string();

    if envelope.is_websocket {
        return proxy_websocket(ws, envelope, stream).await;
    }

    let body = match axum::body::to_bytes(request.into_body(), MAX_FRAME_LEN as usize).await {
        Ok(body) => body,
        Err(e) => {
            debug!("request body read failed: {e}");
            return (StatusCode::BAD_REQUEST, "request body too large").into_response();
        }
    };

    if let Err(e) = write_json(&mut stream, &envelope).await {
        debug!("relay write request failed: {e}");
        return (StatusCode::BAD_GATEWAY, "relay failed").into_response();
    }
    if let Err(e) = write_frame(&mut stream, &body).await {
        debug!("relay write body failed: {e}");
        return (StatusCode::BAD_GATEWAY, "relay failed").into_response();
    }

    let reply: HttpResponseFrame = match read_json(&mut stream).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!("relay read response failed: {e}");
            return (StatusCode::BAD_GATEWAY, "relay failed").into_response();
        }
    };
    let reply_body = match read_frame(&mut stream).await {
        Ok(body) => body,
        Err(e) => {
            debug!("relay read body failed: {e}");
            return (StatusCode::BAD_GATEWAY, "relay failed").into_response();
        }
    };

    let bytes_in = body.len() as i64;
    let bytes_out = reply_body.len() as i64;
    record_request(
        &state,
        &entry,
        &remote_str,
        &method,
        &path_only,
        reply.status,
        bytes_in,
        bytes_out,
    );

    build_response(&reply, reply_body)
}

/// Primary route: first Host label as subdomain. Fallback: enabled custom
/// domain mapped to a tunnel with a live HTTP binding.
fn resolve_route(state: &AppState, host: &str) -> Option<HttpEntry> {
    let subdomain = host.split('.').next().unwrap_or(host);
    if let Some(entry) = state.registry.lookup_http(subdomain) {
        return Some(entry);
    }
    let mapped = match state.store.get_custom_domain(host) {
        Ok(Some(mapped)) => mapped,
        Ok(None) => return None,
        Err(e) => {
            debug!(%host, "custom domain lookup failed: {e}");
            return None;
        }
    };
    if !mapped.status.eq_ignore_ascii_case("enabled") || mapped.tunnel_id.is_empty() {
        return None;
    }
    state.registry.lookup_http_by_tunnel_id(&mapped.tunnel_id)
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(host);
    }
    host.split(':').next().unwrap_or(host)
}

fn is_websocket_request(headers: &HeaderMap) -> bool {
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase();
    connection.contains("upgrade") && upgrade == "websocket"
}

fn header_map_to_wire(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    map
}

fn build_response(reply: &HttpResponseFrame, body: Vec<u8>) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        for (name, values) in &reply.header {
            // Body length is set from the actual bytes we relay.
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
            {
                continue;
            }
            let Ok(name) = HeaderName::try_from(name.as_str()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::try_from(value.as_str()) {
                    headers.append(name.clone(), value);
                }
            }
        }
    }
    response
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[allow(clippy::too_many_arguments)]
fn record_request(
    state: &AppState,
    entry: &HttpEntry,
    remote_addr: &str,
    method: &str,
    path: &str,
    status: u16,
    bytes_in: i64,
    bytes_out: i64,
) {
    state.metrics.add(
        &entry.tunnel_id,
        1,
        bytes_in.unsigned_abs(),
        bytes_out.unsigned_abs(),
    );
    state.traffic_log.push(TrafficEvent {
        tunnel_id: entry.tunnel_id.clone(),
        timestamp: Utc::now(),
        remote_addr: remote_addr.to_string(),
        summary: format!("{method} {path}"),
        status: Some(status),
        bytes_in: bytes_in.unsigned_abs(),
        bytes_out: bytes_out.unsigned_abs(),
    });
    if let Err(e) = state.store.insert_log(&LogEntry {
        tunnel_id: entry.tunnel_id.clone(),
        timestamp: Utc::now(),
        kind: "http".to_string(),
        remote_addr: remote_addr.to_string(),
        summary: format!("{method} {path}"),
        status: Some(status),
        bytes_in,
        bytes_out,
    }) {
        debug!("persist request log failed: {e}");
    }
    if let Err(e) = state
        .store
        .add_metric(&entry.tunnel_id, Utc::now(), 1, 0, bytes_in, bytes_out)
    {
        debug!("persist metric rollup failed: {e}");
    }
}

/// WebSocket pass-through: forward the envelope, wait for the agent's 101,
/// then upgrade the public side and bridge per-message frames.
async fn proxy_websocket(
    ws: Option<WebSocketUpgrade>,
    envelope: HttpRequestFrame,
    mut stream: MuxStream,
) -> Response {
    let Some(ws) = ws else {
        return (StatusCode::BAD_REQUEST, "websocket upgrade expected").into_response();
    };

    if let Err(e) = write_json(&mut stream, &envelope).await {
        debug!("relay write websocket envelope failed: {e}");
        return (StatusCode::BAD_GATEWAY, "relay failed").into_response();
    }
    let reply: HttpResponseFrame = match read_json(&mut stream).await {
        Ok(reply) => reply,
        Err(e) => {
            debug!("relay read websocket response failed: {e}");
            return (StatusCode::BAD_GATEWAY, "relay failed").into_response();
        }
    };
    if reply.status != StatusCode::SWITCHING_PROTOCOLS.as_u16() {
        return StatusCode::from_u16(reply.status)
            .unwrap_or(StatusCode::BAD_GATEWAY)
            .into_response();
    }

    ws.on_upgrade(move |socket| bridge_websocket(socket, stream))
}

/// Copy WebSocket messages in both directions, one tagged frame per
/// message, until either side goes away.
pub(crate) async fn bridge_websocket(socket: WebSocket, stream: MuxStream) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (mut sub_read, mut sub_write) = tokio::io::split(stream);

    let to_agent = async move {
        while let Some(Ok(msg)) = ws_stream.next().await {
            let frame = match msg {
                Message::Text(text) => {
                    let mut frame = vec![WS_MESSAGE_TEXT];
                    frame.extend_from_slice(text.as_bytes());
                    frame
                }
                Message::Binary(data) => {
                    let mut frame = vec![WS_MESSAGE_BINARY];
                    frame.extend_from_slice(&data);
                    frame
                }
                Message::Close(_) => break,
                _ => continue,
            };
            if write_frame(&mut sub_write, &frame).await.is_err() {
                return;
            }
        }
        let _ = write_frame(&mut sub_write, &[]).await;
    };

    let to_public = async move {
        loop {
            let frame = match read_frame(&mut sub_read).await {
                Ok(frame) => frame,
                Err(_) => return,
            };
            if frame.is_empty() {
                return;
            }
            let msg = if frame[0] == WS_MESSAGE_TEXT {
                match String::from_utf8(frame[1..].to_vec()) {
                    Ok(text) => Message::Text(text.into()),
                    Err(_) => return,
                }
            } else {
                Message::Binary(frame[1..].to_vec().into())
            };
            if ws_sink.send(msg).await.is_err() {
                return;
            }
        }
    };

    tokio::select! {
        () = to_agent => {}
        () = to_public => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("app.example.com:8080"), "app.example.com");
        assert_eq!(strip_port("app.example.com"), "app.example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }

    #[test]
    fn test_is_websocket_request() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_request(&headers));

        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_request(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_request(&headers));
    }

    #[test]
    fn test_header_map_to_wire_groups_values() {
        let mut headers = HeaderMap::new();
        headers.append("x-probe", HeaderValue::from_static("one"));
        headers.append("x-probe", HeaderValue::from_static("two"));
        headers.insert(header::HOST, HeaderValue::from_static("app.example.com"));

        let wire = header_map_to_wire(&headers);
        assert_eq!(wire["x-probe"], vec!["one", "two"]);
        assert_eq!(wire["host"], vec!["app.example.com"]);
    }

    #[test]
    fn test_build_response_filters_length_headers() {
        let mut header = HashMap::new();
        header.insert("content-type".to_string(), vec!["text/plain".to_string()]);
        header.insert("content-length".to_string(), vec!["999".to_string()]);
        let reply = HttpResponseFrame {
            status: 200,
            header,
        };
        let response = build_response(&reply, b"world".to_vec());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        assert!(response.headers().get("content-length").map_or(true, |v| v != "999"));
    }
}
