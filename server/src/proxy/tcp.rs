//! Raw TCP ingress.
//!
//! One public listener per reserved external port. Each accepted
//! connection gets a fresh sub-stream: a `tcp_open` preamble frame, then
//! plain bidirectional byte copying until either side ends.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use chrono::Utc;
use portway_proto::frames::write_json;
use portway_proto::messages::ControlMessage;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::registry::Registry;
use crate::store::{LogEntry, Store};

/// Public TCP listener manager.
pub struct TcpProxy {
    registry: Arc<Registry>,
    store: Arc<Store>,
    listeners: Mutex<HashMap<u16, JoinHandle<()>>>,
}

impl TcpProxy {
    #[must_use]
    pub fn new(registry: Arc<Registry>, store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            store,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Idempotently bind `:port` and start its accept loop.
    pub async fn ensure_listener(self: &Arc<Self>, port: u16) -> io::Result<()> {
        if port == 0 {
            return Ok(());
        }
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&port) {
            return Ok(());
        }
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "tcp listener started");
        let proxy = Arc::clone(self);
        let task = tokio::spawn(async move {
            proxy.accept_loop(port, listener).await;
        });
        listeners.insert(port, task);
        Ok(())
    }

    /// Close the listener for `port`. In-flight connections keep running.
    pub async fn remove_listener(&self, port: u16) {
        let mut listeners = self.listeners.lock().await;
        if let Some(task) = listeners.remove(&port) {
            task.abort();
            info!(port, "tcp listener closed");
        }
    }

    /// Close every listener (server shutdown).
    pub async fn shutdown(&self) {
        let mut listeners = self.listeners.lock().await;
        for (_, task) in listeners.drain() {
            task.abort();
        }
    }

    async fn accept_loop(self: Arc<Self>, port: u16, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((conn, peer)) => {
                    let proxy = Arc::clone(&self);
                    tokio::spawn(async move {
                        proxy.handle_conn(port, conn, peer.to_string()).await;
                    });
                }
                Err(e) => {
                    warn!(port, "tcp accept failed: {e}");
                    return;
                }
            }
        }
    }

    async fn handle_conn(&self, port: u16, mut conn: TcpStream, peer: String) {
        let Some(entry) = self.registry.lookup_tcp(port) else {
            return;
        };
        let mut stream = match entry.session.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(port, "sub-stream open failed: {e}");
                return;
            }
        };

        if let Err(e) = write_json(
            &mut stream,
            &ControlMessage::TcpOpen {
                tunnel_id: entry.tunnel_id.clone(),
                external_port: port,
            },
        )
        .await
        {
            debug!(port, "tcp_open write failed: {e}");
            return;
        }

        let (bytes_in, bytes_out) = match copy_bidirectional(&mut conn, &mut stream).await {
            Ok(counts) => counts,
            Err(e) => {
                debug!(port, peer = %peer, "tcp bridge ended: {e}");
                (0, 0)
            }
        };

        if let Err(e) = self.store.insert_log(&LogEntry {
            tunnel_id: entry.tunnel_id.clone(),
            timestamp: Utc::now(),
            kind: "tcp".to_string(),
            remote_addr: peer,
            summary: format!("tcp port {port}"),
            status: None,
            bytes_in: i64::try_from(bytes_in).unwrap_or(i64::MAX),
            bytes_out: i64::try_from(bytes_out).unwrap_or(i64::MAX),
        }) {
            debug!("persist tcp log failed: {e}");
        }
        if let Err(e) = self.store.add_metric(
            &entry.tunnel_id,
            Utc::now(),
            0,
            1,
            i64::try_from(bytes_in).unwrap_or(i64::MAX),
            i64::try_from(bytes_out).unwrap_or(i64::MAX),
        ) {
            debug!("persist tcp metric failed: {e}");
        }
    }
}
