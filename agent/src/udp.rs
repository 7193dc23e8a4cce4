//! UDP tunnel handler.
//!
//! The relay opens one sub-stream per (port, public remote) flow and sends
//! each inbound datagram as an envelope. The handler keeps one local socket
//! per flow, forwarding each datagram and relaying the single reply; a
//! flow that stays silent is evicted by the relay, which closes the
//! sub-stream and ends this task.

use std::time::Duration;

use portway_proto::frames::{read_json, write_json};
use portway_proto::messages::UdpDatagram;
use portway_proto::mux::MuxStream;
use tokio::net::UdpSocket;
use tracing::debug;

/// How long to wait for the local service's reply to each datagram.
const REPLY_DEADLINE: Duration = Duration::from_secs(5);

/// Serve one per-remote flow sub-stream.
pub async fn handle_stream(local_host: String, local_port: u16, mut stream: MuxStream) {
    let host = if local_host.trim().is_empty() {
        "127.0.0.1".to_string()
    } else {
        local_host
    };
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(e) => {
            debug!("udp bind failed: {e}");
            return;
        }
    };
    if let Err(e) = socket.connect((host.as_str(), local_port)).await {
        debug!(%host, local_port, "udp connect failed: {e}");
        return;
    }

    let mut buf = vec![0u8; 65535];
    loop {
        let datagram: UdpDatagram = match read_json(&mut stream).await {
            Ok(datagram) => datagram,
            Err(e) => {
                debug!("udp flow ended: {e}");
                return;
            }
        };
        let Ok(payload) = datagram.decode_payload() else {
            debug!("udp payload decode failed");
            return;
        };
        if let Err(e) = socket.send(&payload).await {
            debug!("udp send failed: {e}");
            return;
        }

        match tokio::time::timeout(REPLY_DEADLINE, socket.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                let reply = UdpDatagram::encode(datagram.remote_addr.clone(), &buf[..n]);
                if let Err(e) = write_json(&mut stream, &reply).await {
                    debug!("udp reply write failed: {e}");
                    return;
                }
            }
            Ok(Err(e)) => {
                debug!("udp recv failed: {e}");
                return;
            }
            // No reply in time; the flow stays up for the next datagram.
            Err(_) => debug!("udp reply deadline elapsed"),
        }
    }
}
