//! TCP tunnel handler: one sub-stream per public connection.

use portway_proto::frames::read_json;
use portway_proto::messages::ControlMessage;
use portway_proto::mux::MuxStream;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tracing::debug;

/// Bridge one proxied TCP connection to the local target.
pub async fn handle_stream(local_host: String, local_port: u16, mut stream: MuxStream) {
    let preamble: ControlMessage = match read_json(&mut stream).await {
        Ok(msg) => msg,
        Err(e) => {
            debug!("tcp preamble read failed: {e}");
            return;
        }
    };
    let ControlMessage::TcpOpen { external_port, .. } = preamble else {
        debug!("unexpected tcp preamble");
        return;
    };
    if local_port == 0 {
        debug!(external_port, "no local port configured");
        return;
    }

    let host = if local_host.trim().is_empty() {
        "localhost".to_string()
    } else {
        local_host
    };
    let mut conn = match TcpStream::connect((host.as_str(), local_port)).await {
        Ok(conn) => conn,
        Err(e) => {
            debug!(%host, local_port, "local dial failed: {e}");
            return;
        }
    };

    if let Err(e) = copy_bidirectional(&mut stream, &mut conn).await {
        debug!("tcp bridge ended: {e}");
    }
}
