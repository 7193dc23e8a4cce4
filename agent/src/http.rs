//! HTTP tunnel handler: proxied requests in, local origin out.

use std::collections::HashMap;

use futures_util::{SinkExt, StreamExt};
use portway_proto::frames::{read_frame, read_json, write_frame, write_json};
use portway_proto::messages::{
    HttpRequestFrame, HttpResponseFrame, WS_MESSAGE_BINARY, WS_MESSAGE_TEXT,
};
use portway_proto::mux::MuxStream;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// Headers never forwarded to the local origin.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Handle one proxied HTTP exchange on a data sub-stream.
pub async fn handle_stream(client: reqwest::Client, local_base: String, mut stream: MuxStream) {
    let envelope: HttpRequestFrame = match read_json(&mut stream).await {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("request envelope read failed: {e}");
            return;
        }
    };

    if envelope.is_websocket {
        handle_websocket(&local_base, envelope, stream).await;
        return;
    }

    let body = match read_frame(&mut stream).await {
        Ok(body) => body,
        Err(e) => {
            debug!("request body read failed: {e}");
            return;
        }
    };

    let (reply, reply_body) = forward_request(&client, &local_base, &envelope, body).await;
    if let Err(e) = write_json(&mut stream, &reply).await {
        debug!("response envelope write failed: {e}");
        return;
    }
    if let Err(e) = write_frame(&mut stream, &reply_body).await {
        debug!("response body write failed: {e}");
    }
}

async fn forward_request(
    client: &reqwest::Client,
    local_base: &str,
    envelope: &HttpRequestFrame,
    body: Vec<u8>,
) -> (HttpResponseFrame, Vec<u8>) {
    let url = format!("{local_base}{}", envelope.path);
    let Ok(method) = reqwest::Method::from_bytes(envelope.method.as_bytes()) else {
        return (bad_gateway(), b"invalid method".to_vec());
    };

    let response = client
        .request(method, &url)
        .headers(wire_headers(&envelope.header))
        .body(body)
        .send()
        .await;
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            debug!(%url, "local origin request failed: {e}");
            return (bad_gateway(), b"upstream error".to_vec());
        }
    };

    let status = response.status().as_u16();
    let mut header: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            header
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    let reply_body = match response.bytes().await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            debug!("local origin body read failed: {e}");
            return (bad_gateway(), b"read response failed".to_vec());
        }
    };

    (HttpResponseFrame { status, header }, reply_body)
}

fn bad_gateway() -> HttpResponseFrame {
    HttpResponseFrame {
        status: 502,
        header: HashMap::new(),
    }
}

fn wire_headers(header: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in header {
        let lower = name.to_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) || lower.starts_with("sec-websocket-") {
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
    headers
}

/// Translate the local origin base URL to its WebSocket form.
fn ws_base(local_base: &str) -> String {
    if let Some(rest) = local_base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if let Some(rest) = local_base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else {
        local_base.to_string()
    }
}

/// WebSocket pass-through: dial the local endpoint, answer 101, then relay
/// tagged frames (one per message) in both directions.
async fn handle_websocket(local_base: &str, envelope: HttpRequestFrame, mut stream: MuxStream) {
    let url = format!("{}{}", ws_base(local_base), envelope.path);
    let Ok(mut request) = url.as_str().into_client_request() else {
        let _ = write_json(&mut stream, &bad_gateway()).await;
        return;
    };
    // Forward application headers; tungstenite supplies its own handshake.
    for (name, value) in wire_headers(&envelope.header) {
        if let Some(name) = name {
            request.headers_mut().insert(name, value);
        }
    }

    let socket = match tokio_tungstenite::connect_async(request).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            debug!(%url, "local websocket dial failed: {e}");
            let _ = write_json(&mut stream, &bad_gateway()).await;
            return;
        }
    };

    let switching = HttpResponseFrame {
        status: 101,
        header: HashMap::new(),
    };
    if write_json(&mut stream, &switching).await.is_err() {
        return;
    }

    let (mut ws_sink, mut ws_stream) = socket.split();
    let (mut sub_read, mut sub_write) = tokio::io::split(stream);

    let to_relay = async move {
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

    let to_local = async move {
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
        () = to_relay => {}
        () = to_local => {}
    }
}
