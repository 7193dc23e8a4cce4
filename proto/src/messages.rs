//! Wire envelopes exchanged between the relay server and the agent.
//!
//! All envelopes are JSON frames (see [`crate::frames`]) with snake_case
//! fields. Control messages carry a `type` tag; unknown fields are ignored
//! on receipt so older peers keep working.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Error code sent when the hello token is rejected.
pub const ERR_UNAUTHORIZED: &str = "unauthorized";
/// Error code sent when a registration conflicts with an existing binding.
pub const ERR_REGISTRATION_FAILED: &str = "registration_failed";

/// Tag byte prefixing a bridged WebSocket text message.
pub const WS_MESSAGE_TEXT: u8 = 0x1;
/// Tag byte prefixing a bridged WebSocket binary message.
pub const WS_MESSAGE_BINARY: u8 = 0x2;

/// The protocol kind an agent registers for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Tcp,
    Udp,
}

impl TunnelProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown tunnel protocol {0:?}")]
pub struct ParseProtocolError(String);

impl FromStr for TunnelProtocol {
    type Err = ParseProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(ParseProtocolError(other.to_string())),
        }
    }
}

/// Registration envelope, first message on a fresh control sub-stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hello {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<TunnelProtocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<u16>,
}

/// Messages observed on control sub-streams (and the `tcp_open` preamble on
/// TCP data sub-streams).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello(Hello),
    HelloOk {
        client_id: String,
    },
    Error {
        code: String,
        message: String,
    },
    Heartbeat {
        timestamp: String,
    },
    TcpOpen {
        tunnel_id: String,
        external_port: u16,
    },
}

impl ControlMessage {
    /// Shorthand for the error envelope.
    #[must_use]
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// HTTP request envelope, written by the server's HTTP proxy as the first
/// frame of a data sub-stream. The body follows as one separate frame
/// unless `is_websocket` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequestFrame {
    pub method: String,
    /// Request-URI: path plus query string.
    pub path: String,
    pub host: String,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub is_websocket: bool,
}

/// HTTP response envelope, written by the agent. One body frame follows
/// unless the exchange switched to WebSocket streaming (status 101).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResponseFrame {
    pub status: u16,
    #[serde(default)]
    pub header: HashMap<String, Vec<String>>,
}

/// UDP datagram envelope, either direction on a UDP data sub-stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpDatagram {
    pub remote_addr: String,
    pub payload_b64: String,
}

impl UdpDatagram {
    /// Build an envelope carrying `payload` for `remote_addr`.
    #[must_use]
    pub fn encode(remote_addr: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            payload_b64: BASE64.encode(payload),
        }
    }

    /// Decode the base64 payload.
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.payload_b64)
    }
}
