//! Datagram UDP ingress.
//!
//! UDP has no connections, so the proxy emulates flows: one bound socket
//! per reserved port, and per-remote-address sub-stream sessions. Inbound
//! datagrams go to the agent as base64 envelopes; a reader task per flow
//! writes decoded replies back to the original remote. Flows idle for two
//! minutes are evicted, swept at most every 30 seconds.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use portway_proto::frames::{read_json, write_json};
use portway_proto::messages::UdpDatagram;
use portway_proto::mux::MuxStream;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::{Registry, UdpEntry};
use crate::store::{LogEntry, Store};

/// A flow is evicted after this long without traffic in either direction.
pub(crate) const IDLE_TIMEOUT: Duration = Duration::from_secs(120);
/// Idle sweeps run at most this often.
pub(crate) const SWEEP_EVERY: Duration = Duration::from_secs(30);

/// One per-remote sub-stream session.
struct UdpFlow {
    remote: SocketAddr,
    writer: Mutex<WriteHalf<MuxStream>>,
    last_seen: Mutex<Instant>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl UdpFlow {
    async fn touch(&self) {
        *self.last_seen.lock().await = Instant::now();
    }

    fn stop_reader(&self) {
        if let Some(task) = self.reader.lock().expect("udp reader lock poisoned").take() {
            task.abort();
        }
    }
}

struct PortState {
    read_loop: JoinHandle<()>,
    flows: HashMap<String, Arc<UdpFlow>>,
}

/// Public UDP socket and flow manager.
pub struct UdpProxy {
    registry: Arc<Registry>,
    store: Arc<Store>,
    ports: Mutex<HashMap<u16, PortState>>,
    last_sweep: Mutex<Instant>,
}

impl UdpProxy {
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            ports: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
        })
    }

    /// Idempotently bind the UDP socket for `port` and start its read loop.
    pub async fn ensure_listener(self: &Arc<Self>, port: u16) -> io::Result<()> {
        if port == 0 {
            return Ok(());
        }
        let mut ports = self.ports.lock().await;
        if ports.contains_key(&port) {
            return Ok(());
        }
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        info!(port, "udp listener started");
        let proxy = Arc::clone(self);
        let read_loop = tokio::spawn(async move {
            proxy.read_loop(port, socket).await;
        });
        ports.insert(
            port,
            PortState {
                read_loop,
                flows: HashMap::new(),
            },
        );
        Ok(())
    }

    /// Close the socket for `port` and every flow on it.
    pub async fn remove_listener(&self, port: u16) {
        let mut ports = self.ports.lock().await;
        if let Some(state) = ports.remove(&port) {
            state.read_loop.abort();
            for flow in state.flows.values() {
                flow.stop_reader();
            }
            info!(port, "udp listener closed");
        }
    }

    /// Close every socket and flow (server shutdown).
    pub async fn shutdown(&self) {
        let mut ports = self.ports.lock().await;
        for (_, state) in ports.drain() {
            state.read_loop.abort();
            for flow in state.flows.values() {
                flow.stop_reader();
            }
        }
    }

    async fn read_loop(self: Arc<Self>, port: u16, socket: Arc<UdpSocket>) {
        let mut buf = vec![0u8; 65535];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((n, addr)) => {
                    self.handle_datagram(port, &socket, addr, &buf[..n]).await;
                }
                Err(e) => {
                    warn!(port, "udp recv failed: {e}");
                    return;
                }
            }
        }
    }

    async fn handle_datagram(
        self: &Arc<Self>,
        port: u16,
        socket: &Arc<UdpSocket>,
        addr: SocketAddr,
        payload: &[u8],
    ) {
        let Some(entry) = self.registry.lookup_udp(port) else {
            return;
        };
        let remote = addr.to_string();
        let Some(flow) = self.get_or_create_flow(port, &remote, addr, &entry, socket).await else {
            return;
        };
        flow.touch().await;

        let datagram = UdpDatagram::encode(remote.clone(), payload);
        let write_failed = {
            let mut writer = flow.writer.lock().await;
            write_json(&mut *writer, &datagram).await.is_err()
        };
        if write_failed {
            self.drop_flow(port, &remote).await;
            return;
        }

        if let Err(e) = self.store.insert_log(&LogEntry {
            tunnel_id: entry.tunnel_id.clone(),
            timestamp: Utc::now(),
            kind: "udp".to_string(),
            remote_addr: remote,
            summary: format!("udp port {port}"),
            status: None,
            bytes_in: payload.len() as i64,
            bytes_out: 0,
        }) {
            debug!("persist udp log failed: {e}");
        }
        if let Err(e) =
            self.store
                .add_metric(&entry.tunnel_id, Utc::now(), 0, 1, payload.len() as i64, 0)
        {
            debug!("persist udp metric failed: {e}");
        }

        self.maybe_sweep(port).await;
    }

    /// Find or create the flow for `remote`. Creation opens the sub-stream
    /// outside the lock and re-checks afterwards; the loser of the race
    /// closes its stream and uses the winner's flow.
    async fn get_or_create_flow(
        self: &Arc<Self>,
        port: u16,
        remote: &str,
        addr: SocketAddr,
        entry: &UdpEntry,
        socket: &Arc<UdpSocket>,
    ) -> Option<Arc<UdpFlow>> {
        {
            let ports = self.ports.lock().await;
            if let Some(flow) = ports.get(&port).and_then(|s| s.flows.get(remote)) {
                return Some(Arc::clone(flow));
            }
        }

        let stream = match entry.session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(port, "udp sub-stream open failed: {e}");
                return None;
            }
        };
        let (read_half, write_half) = tokio::io::split(stream);

        let flow = Arc::new(UdpFlow {
            remote: addr,
            writer: Mutex::new(write_half),
            last_seen: Mutex::new(Instant::now()),
            reader: std::sync::Mutex::new(None),
        });

        let mut ports = self.ports.lock().await;
        let state = ports.get_mut(&port)?;
        if let Some(existing) = state.flows.get(remote) {
            // Lost the creation race; the new stream is dropped.
            return Some(Arc::clone(existing));
        }
        state.flows.insert(remote.to_string(), Arc::clone(&flow));

        // Spawn and record the reader before releasing the lock so eviction
        // can never observe a flow without its reader handle.
        let proxy = Arc::clone(self);
        let reader_flow = Arc::clone(&flow);
        let reader_socket = Arc::clone(socket);
        let remote_key = remote.to_string();
        let tunnel_id = entry.tunnel_id.clone();
        let task = tokio::spawn(async move {
            proxy
                .read_replies(port, remote_key, tunnel_id, reader_flow, read_half, reader_socket)
                .await;
        });
        *flow.reader.lock().expect("udp reader lock poisoned") = Some(task);
        drop(ports);

        Some(flow)
    }

    /// Per-flow reader: agent replies come back as envelopes and are written
    /// to the public socket at the flow's original remote address.
    async fn read_replies(
        self: Arc<Self>,
        port: u16,
        remote: String,
        tunnel_id: String,
        flow: Arc<UdpFlow>,
        mut read_half: ReadHalf<MuxStream>,
        socket: Arc<UdpSocket>,
    ) {
        loop {
            let reply: UdpDatagram = match read_json(&mut read_half).await {
                Ok(reply) => reply,
                Err(_) => break,
            };
            let Ok(data) = reply.decode_payload() else {
                break;
            };
            if socket.send_to(&data, flow.remote).await.is_err() {
                break;
            }
            flow.touch().await;
            if let Err(e) =
                self.store
                    .add_metric(&tunnel_id, Utc::now(), 0, 1, 0, data.len() as i64)
            {
                debug!("persist udp reply metric failed: {e}");
            }
        }
        self.drop_flow(port, &remote).await;
    }

    async fn drop_flow(&self, port: u16, remote: &str) {
        let mut ports = self.ports.lock().await;
        if let Some(state) = ports.get_mut(&port) {
            if let Some(flow) = state.flows.remove(remote) {
                flow.stop_reader();
            }
        }
    }

    /// Evict idle flows for `port`, at most once per [`SWEEP_EVERY`].
    async fn maybe_sweep(&self, port: u16) {
        {
            let mut last = self.last_sweep.lock().await;
            if last.elapsed() < SWEEP_EVERY {
                return;
            }
            *last = Instant::now();
        }
        self.sweep_idle(port, Instant::now()).await;
    }

    async fn sweep_idle(&self, port: u16, now: Instant) {
        let mut ports = self.ports.lock().await;
        let Some(state) = ports.get_mut(&port) else {
            return;
        };
        let mut expired = Vec::new();
        for (remote, flow) in &state.flows {
            let last_seen = *flow.last_seen.lock().await;
            if now.duration_since(last_seen) > IDLE_TIMEOUT {
                expired.push(remote.clone());
            }
        }
        for remote in expired {
            if let Some(flow) = state.flows.remove(&remote) {
                flow.stop_reader();
                debug!(port, %remote, "udp flow evicted (idle)");
            }
        }
    }
}
