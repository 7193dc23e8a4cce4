//! Relay client core.
//!
//! One registration = one outbound WebSocket to the relay, a multiplex
//! client session on top, a hello on the first (control) sub-stream, then
//! heartbeats while the relay opens data sub-streams that are dispatched
//! to the protocol handler.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use portway_proto::frames::{read_json, write_json};
use portway_proto::messages::{ControlMessage, Hello, TunnelProtocol};
use portway_proto::mux::{self, Mode, MuxIncoming, MuxStream};
use portway_proto::ws::WsByteStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{http, tcp, udp};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Settings for one relay connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay WebSocket URL, e.g. `ws://relay.example.com/relay`.
    pub url: String,
    pub token: String,
    /// Stable client id; a fresh UUID when empty.
    pub client_id: String,
    /// Heartbeat period (default 10 s).
    pub heartbeat: Duration,
    /// Base URL of the local HTTP origin (http tunnels).
    pub local_base_url: String,
    /// Local host to dial (tcp/udp tunnels).
    pub local_host: String,
    /// Local port to dial (tcp/udp tunnels).
    pub local_port: u16,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            token: String::new(),
            client_id: String::new(),
            heartbeat: Duration::from_secs(10),
            local_base_url: String::new(),
            local_host: String::new(),
            local_port: 0,
        }
    }
}

/// A relay client bound to one configuration.
pub struct RelayClient {
    cfg: ClientConfig,
    http_client: reqwest::Client,
}

impl RelayClient {
    #[must_use]
    pub fn new(mut cfg: ClientConfig) -> Self {
        if cfg.client_id.trim().is_empty() {
            cfg.client_id = uuid::Uuid::new_v4().to_string();
        }
        if cfg.heartbeat.is_zero() {
            cfg.heartbeat = Duration::from_secs(10);
        }
        cfg.local_base_url = cfg.local_base_url.trim_end_matches('/').to_string();
        Self {
            cfg,
            http_client: reqwest::Client::new(),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.cfg.client_id
    }

    /// Heartbeat-only session: connect, hello without a registration, keep
    /// the control stream warm until cancelled or the relay goes away.
    pub async fn run_relay(&self) -> Result<(), BoxError> {
        let (_incoming, mut control) = self.connect_and_hello(self.base_hello()).await?;
        info!(client_id = %self.cfg.client_id, "relay connected");
        self.heartbeat_loop(&mut control).await
    }

    /// Register an HTTP tunnel and serve proxied requests.
    pub async fn run_http(&self, subdomain: &str, allowlist: Vec<String>) -> Result<(), BoxError> {
        if self.cfg.local_base_url.is_empty() {
            return Err("local base url required".into());
        }
        let mut hello = self.base_hello();
        hello.tunnel_id = Some(uuid::Uuid::new_v4().to_string());
        hello.protocol = Some(TunnelProtocol::Http);
        hello.subdomain = Some(subdomain.to_string());
        hello.allowlist = allowlist;

        let (incoming, mut control) = self.connect_and_hello(hello).await?;
        info!(client_id = %self.cfg.client_id, subdomain, "http tunnel registered");

        let client = self.http_client.clone();
        let base = self.cfg.local_base_url.clone();
        self.serve(incoming, &mut control, move |stream| {
            let client = client.clone();
            let base = base.clone();
            async move {
                http::handle_stream(client, base, stream).await;
            }
        })
        .await
    }

    /// Register a TCP tunnel and bridge connections to the local target.
    pub async fn run_tcp(&self, external_port: u16) -> Result<(), BoxError> {
        if external_port == 0 {
            return Err("external port required".into());
        }
        let mut hello = self.base_hello();
        hello.tunnel_id = Some(uuid::Uuid::new_v4().to_string());
        hello.protocol = Some(TunnelProtocol::Tcp);
        hello.external_port = Some(external_port);

        let (incoming, mut control) = self.connect_and_hello(hello).await?;
        info!(client_id = %self.cfg.client_id, external_port, "tcp tunnel registered");

        let host = self.cfg.local_host.clone();
        let port = self.cfg.local_port;
        self.serve(incoming, &mut control, move |stream| {
            let host = host.clone();
            async move {
                tcp::handle_stream(host, port, stream).await;
            }
        })
        .await
    }

    /// Register a UDP tunnel and answer proxied datagrams.
    pub async fn run_udp(&self, external_port: u16) -> Result<(), BoxError> {
        if external_port == 0 {
            return Err("external port required".into());
        }
        let mut hello = self.base_hello();
        hello.tunnel_id = Some(uuid::Uuid::new_v4().to_string());
        hello.protocol = Some(TunnelProtocol::Udp);
        hello.external_port = Some(external_port);

        let (incoming, mut control) = self.connect_and_hello(hello).await?;
        info!(client_id = %self.cfg.client_id, external_port, "udp tunnel registered");

        let host = self.cfg.local_host.clone();
        let port = self.cfg.local_port;
        self.serve(incoming, &mut control, move |stream| {
            let host = host.clone();
            async move {
                udp::handle_stream(host, port, stream).await;
            }
        })
        .await
    }

    fn base_hello(&self) -> Hello {
        Hello {
            token: self.cfg.token.clone(),
            client_id: self.cfg.client_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            local_host: if self.cfg.local_host.is_empty() {
                None
            } else {
                Some(self.cfg.local_host.clone())
            },
            local_port: if self.cfg.local_port == 0 {
                None
            } else {
                Some(self.cfg.local_port)
            },
            ..Hello::default()
        }
    }

    /// Dial the relay, start the multiplex session, open the control
    /// sub-stream and complete the hello exchange.
    async fn connect_and_hello(&self, hello: Hello) -> Result<(MuxIncoming, MuxStream), BoxError> {
        let mut request = self.cfg.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("binary"),
        );
        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;

        let transport = WsByteStream::<_, Message>::new(socket);
        let (session, incoming) = mux::spawn(transport, Mode::Client);
        let mut control = session.open_stream().await?;

        write_json(&mut control, &ControlMessage::Hello(hello)).await?;
        match read_json::<_, ControlMessage>(&mut control).await? {
            ControlMessage::HelloOk { client_id } => {
                debug!(%client_id, "hello acknowledged");
                Ok((incoming, control))
            }
            ControlMessage::Error { code, message } => {
                Err(format!("relay rejected registration ({code}): {message}").into())
            }
            _ => Err("unexpected relay response".into()),
        }
    }

    /// Run heartbeats and the data sub-stream accept loop until either
    /// fails; each inbound sub-stream gets its own task.
    async fn serve<F, Fut>(
        &self,
        mut incoming: MuxIncoming,
        control: &mut MuxStream,
        handler: F,
    ) -> Result<(), BoxError>
    where
        F: Fn(MuxStream) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let accept = async {
            while let Some(stream) = incoming.accept().await {
                tokio::spawn(handler(stream));
            }
            Err::<(), BoxError>("relay session ended".into())
        };

        tokio::select! {
            res = self.heartbeat_loop(control) => res,
            res = accept => res,
        }
    }

    async fn heartbeat_loop(&self, control: &mut MuxStream) -> Result<(), BoxError> {
        let mut interval = tokio::time::interval(self.cfg.heartbeat);
        // The immediate first tick doubles as a liveness probe.
        loop {
            interval.tick().await;
            let heartbeat = ControlMessage::Heartbeat {
                timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            };
            if let Err(e) = write_json(control, &heartbeat).await {
                warn!("heartbeat write failed: {e}");
                return Err(e.into());
            }
        }
    }
}
