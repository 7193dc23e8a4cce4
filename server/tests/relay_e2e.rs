//! End-to-end relay scenarios over loopback sockets: a real server stack,
//! real WebSocket agents, and raw public clients.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portway_proto::frames::{read_frame, read_json, write_frame, write_json};
use portway_proto::messages::{
    ControlMessage, Hello, HttpRequestFrame, HttpResponseFrame, TunnelProtocol, UdpDatagram,
    WS_MESSAGE_BINARY, WS_MESSAGE_TEXT,
};
use portway_proto::mux::{self, Mode, MuxHandle, MuxIncoming, MuxStream};
use portway_proto::ws::WsByteStream;
use portway_server::{state, AppState, Config, Store};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::HOST;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

const TOKEN: &str = "test-relay-token";

async fn start_relay() -> (SocketAddr, AppState, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(&dir.path().join("relay.db")).unwrap();
    store
        .apply_migrations(&Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations"))
        .unwrap();
    store.insert_token(TOKEN).unwrap();

    let state = AppState::new(Config::default(), store);
    let app = state::router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (addr, state, dir)
}

/// Dial the relay as an agent and complete the hello exchange.
async fn connect_agent(
    addr: SocketAddr,
    hello: Hello,
) -> Result<(MuxHandle, MuxIncoming, MuxStream), String> {
    let url = format!("ws://{addr}/relay");
    let mut request = url.as_str().into_client_request().unwrap();
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static("binary"),
    );
    let (socket, _response) = tokio_tungstenite::connect_async(request).await.unwrap();
    let (handle, incoming) = mux::spawn(WsByteStream::<_, Message>::new(socket), Mode::Client);

    let mut control = handle.open_stream().await.unwrap();
    write_json(&mut control, &ControlMessage::Hello(hello))
        .await
        .unwrap();
    match read_json::<_, ControlMessage>(&mut control).await.unwrap() {
        ControlMessage::HelloOk { .. } => Ok((handle, incoming, control)),
        ControlMessage::Error { code, message } => Err(format!("{code}: {message}")),
        other => Err(format!("unexpected response: {other:?}")),
    }
}

fn hello_base(client_id: &str) -> Hello {
    Hello {
        token: TOKEN.to_string(),
        client_id: client_id.to_string(),
        version: "test".to_string(),
        tunnel_id: Some(uuid::Uuid::new_v4().to_string()),
        ..Hello::default()
    }
}

async fn raw_http_get(addr: SocketAddr, host: &str, path: &str) -> String {
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    conn.write_all(request.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    conn.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).to_string()
}

async fn wait_for(what: &str, check: impl Fn() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Reserve a free port by binding and immediately releasing it.
async fn free_tcp_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap().port()
}

/// S1: register an HTTP tunnel, serve one GET end to end, and verify the
/// log entry and metric rollup.
#[tokio::test]
async fn test_http_happy_path() {
    let (addr, state, _dir) = start_relay().await;

    let mut hello = hello_base("agent-s1");
    let tunnel_id = hello.tunnel_id.clone().unwrap();
    hello.protocol = Some(TunnelProtocol::Http);
    hello.subdomain = Some("app".to_string());
    let (_handle, mut incoming, _control) = connect_agent(addr, hello).await.unwrap();

    // Inline agent: answer every proxied request with 200 "world".
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.accept().await {
            tokio::spawn(async move {
                let envelope: HttpRequestFrame = read_json(&mut stream).await.unwrap();
                let _body = read_frame(&mut stream).await.unwrap();
                assert_eq!(envelope.method, "GET");
                assert_eq!(envelope.path, "/hello");
                let reply = HttpResponseFrame {
                    status: 200,
                    header: HashMap::new(),
                };
                write_json(&mut stream, &reply).await.unwrap();
                write_frame(&mut stream, b"world").await.unwrap();
            });
        }
    });

    let response = raw_http_get(addr, "app.example", "/hello").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("world"), "got: {response}");

    let log_store = Arc::clone(&state.store);
    wait_for("http log entry", move || {
        log_store.list_logs(10).unwrap().iter().any(|entry| {
            entry.kind == "http" && entry.summary == "GET /hello" && entry.bytes_out == 5
        })
    })
    .await;

    let metrics = state.store.list_metrics(10).unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].tunnel_id, tunnel_id);
    assert!(metrics[0].rollup.req_count >= 1);

    // The in-memory collector and rolling log saw the request too.
    let counters = state.metrics.snapshot();
    assert!(counters[&tunnel_id].requests >= 1);
    assert!(!state.traffic_log.snapshot().is_empty());
}

/// A request whose Host matches no subdomain is routed through an enabled
/// custom-domain mapping to the same live tunnel.
#[tokio::test]
async fn test_custom_domain_fallback_route() {
    let (addr, state, _dir) = start_relay().await;

    let mut hello = hello_base("agent-cd");
    let tunnel_id = hello.tunnel_id.clone().unwrap();
    hello.protocol = Some(TunnelProtocol::Http);
    hello.subdomain = Some("cd-app".to_string());
    let (_handle, mut incoming, _control) = connect_agent(addr, hello).await.unwrap();

    tokio::spawn(async move {
        while let Some(mut stream) = incoming.accept().await {
            tokio::spawn(async move {
                let _envelope: HttpRequestFrame = read_json(&mut stream).await.unwrap();
                let _body = read_frame(&mut stream).await.unwrap();
                let reply = HttpResponseFrame {
                    status: 200,
                    header: HashMap::new(),
                };
                write_json(&mut stream, &reply).await.unwrap();
                write_frame(&mut stream, b"custom").await.unwrap();
            });
        }
    });

    state
        .store
        .upsert_custom_domain(&portway_server::store::CustomDomain {
            domain: "shop.example.net".to_string(),
            tunnel_id: tunnel_id.clone(),
            status: "enabled".to_string(),
            ..portway_server::store::CustomDomain::default()
        })
        .unwrap();

    let response = raw_http_get(addr, "shop.example.net", "/").await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("custom"), "got: {response}");

    // A pending mapping does not route.
    state
        .store
        .upsert_custom_domain(&portway_server::store::CustomDomain {
            domain: "pending.example.net".to_string(),
            tunnel_id,
            status: "pending".to_string(),
            ..portway_server::store::CustomDomain::default()
        })
        .unwrap();
    let response = raw_http_get(addr, "pending.example.net", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
}

/// S2: a second agent claiming the same subdomain with a different tunnel
/// id is rejected; the first stays active.
#[tokio::test]
async fn test_subdomain_conflict() {
    let (addr, state, _dir) = start_relay().await;

    let mut first = hello_base("agent-a");
    first.protocol = Some(TunnelProtocol::Http);
    first.subdomain = Some("dup".to_string());
    let _session = connect_agent(addr, first).await.unwrap();

    let mut second = hello_base("agent-b");
    second.protocol = Some(TunnelProtocol::Http);
    second.subdomain = Some("dup".to_string());
    let err = connect_agent(addr, second).await.unwrap_err();
    assert!(err.starts_with("registration_failed"), "got: {err}");

    assert!(state.registry.lookup_http("dup").is_some());
}

/// Teardown: when the agent session ends, the registry entry goes away and
/// public requests see 404.
#[tokio::test]
async fn test_teardown_on_session_close() {
    let (addr, state, _dir) = start_relay().await;

    let mut hello = hello_base("agent-gone");
    hello.protocol = Some(TunnelProtocol::Http);
    hello.subdomain = Some("gone".to_string());
    let (handle, _incoming, _control) = connect_agent(addr, hello).await.unwrap();

    let registry = Arc::clone(&state.registry);
    wait_for("binding", move || registry.lookup_http("gone").is_some()).await;

    handle.close().await;

    let registry = Arc::clone(&state.registry);
    wait_for("teardown", move || registry.lookup_http("gone").is_none()).await;

    let response = raw_http_get(addr, "gone.example", "/").await;
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
}

/// S3: a TCP tunnel bridges bytes both ways and records a log entry.
#[tokio::test]
async fn test_tcp_port_bridge() {
    let (addr, state, _dir) = start_relay().await;
    let port = free_tcp_port().await;

    let mut hello = hello_base("agent-s3");
    hello.protocol = Some(TunnelProtocol::Tcp);
    hello.external_port = Some(port);
    let (_handle, mut incoming, _control) = connect_agent(addr, hello).await.unwrap();

    // Inline agent: expect "PING\n" on the bridged stream, answer "PONG\n".
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.accept().await {
            tokio::spawn(async move {
                let preamble: ControlMessage = read_json(&mut stream).await.unwrap();
                assert!(matches!(preamble, ControlMessage::TcpOpen { .. }));
                let mut buf = [0u8; 5];
                stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"PING\n");
                stream.write_all(b"PONG\n").await.unwrap();
                stream.flush().await.unwrap();
            });
        }
    });

    // The public listener comes up asynchronously with the registration.
    let mut conn = None;
    for _ in 0..50 {
        if let Ok(c) = TcpStream::connect(("127.0.0.1", port)).await {
            conn = Some(c);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let mut conn = conn.expect("public tcp listener not reachable");

    conn.write_all(b"PING\n").await.unwrap();
    let mut reply = [0u8; 5];
    conn.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PONG\n");
    drop(conn);

    let log_store = Arc::clone(&state.store);
    wait_for("tcp log entry", move || {
        log_store
            .list_logs(10)
            .unwrap()
            .iter()
            .any(|entry| entry.kind == "tcp" && entry.bytes_in == 5 && entry.bytes_out == 5)
    })
    .await;
}

/// S4: UDP datagrams flow both ways, and a second datagram from the same
/// remote reuses the existing sub-stream session.
#[tokio::test]
async fn test_udp_flow_and_session_reuse() {
    let (addr, _state, _dir) = start_relay().await;
    let port = free_udp_port().await;

    let mut hello = hello_base("agent-s4");
    hello.protocol = Some(TunnelProtocol::Udp);
    hello.external_port = Some(port);
    let (_handle, mut incoming, _control) = connect_agent(addr, hello).await.unwrap();

    let streams_opened = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&streams_opened);
    tokio::spawn(async move {
        while let Some(mut stream) = incoming.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                loop {
                    let datagram: UdpDatagram = match read_json(&mut stream).await {
                        Ok(datagram) => datagram,
                        Err(_) => return,
                    };
                    assert_eq!(datagram.decode_payload().unwrap(), b"abc");
                    let reply = UdpDatagram::encode(datagram.remote_addr, b"xyz");
                    if write_json(&mut stream, &reply).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];

    // The public socket comes up asynchronously; retry the first exchange.
    let mut first = None;
    for _ in 0..50 {
        client.send_to(b"abc", ("127.0.0.1", port)).await.unwrap();
        if let Ok(Ok((n, _))) =
            tokio::time::timeout(Duration::from_millis(200), client.recv_from(&mut buf)).await
        {
            first = Some(n);
            break;
        }
    }
    let n = first.expect("no udp reply");
    assert_eq!(&buf[..n], b"xyz");

    // Second datagram from the same socket: same flow, same sub-stream.
    client.send_to(b"abc", ("127.0.0.1", port)).await.unwrap();
    let (n, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
        .await
        .expect("second reply timed out")
        .unwrap();
    assert_eq!(&buf[..n], b"xyz");
    assert_eq!(streams_opened.load(Ordering::SeqCst), 1);
}

/// S5: WebSocket upgrade passes through and message boundaries plus the
/// text/binary distinction survive the relay.
#[tokio::test]
async fn test_websocket_passthrough() {
    let (addr, _state, _dir) = start_relay().await;

    let mut hello = hello_base("agent-s5");
    hello.protocol = Some(TunnelProtocol::Http);
    hello.subdomain = Some("ws".to_string());
    let (_handle, mut incoming, _control) = connect_agent(addr, hello).await.unwrap();

    // Inline agent: accept the upgrade and echo tagged frames back.
    tokio::spawn(async move {
        while let Some(stream) = incoming.accept().await {
            tokio::spawn(echo_websocket(stream));
        }
    });

    let url = format!("ws://{addr}/chat");
    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(HOST, HeaderValue::from_static("ws.example"));
    let (mut socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(response.status().as_u16(), 101);

    use futures_util::{SinkExt, StreamExt};
    socket
        .send(Message::Text("round trip".into()))
        .await
        .unwrap();
    let echoed = socket.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Text("round trip".into()));

    socket
        .send(Message::Binary(vec![1u8, 2, 3].into()))
        .await
        .unwrap();
    let echoed = socket.next().await.unwrap().unwrap();
    assert_eq!(echoed, Message::Binary(vec![1u8, 2, 3].into()));
}

async fn echo_websocket(mut stream: MuxStream) {
    let envelope: HttpRequestFrame = read_json(&mut stream).await.unwrap();
    assert!(envelope.is_websocket);
    assert_eq!(envelope.path, "/chat");
    let switching = HttpResponseFrame {
        status: 101,
        header: HashMap::new(),
    };
    write_json(&mut stream, &switching).await.unwrap();

    loop {
        let frame = match read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if frame.is_empty() {
            return;
        }
        assert!(frame[0] == WS_MESSAGE_TEXT || frame[0] == WS_MESSAGE_BINARY);
        if write_frame(&mut stream, &frame).await.is_err() {
            return;
        }
    }
}
