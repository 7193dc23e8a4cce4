//! Multiplex session wrapper.
//!
//! One yamux connection runs over each relay WebSocket. The connection
//! object wants to be polled from a single place, so [`spawn`] moves it
//! into a driver task and hands back two halves:
//!
//! - [`MuxHandle`] — clonable; opens outbound sub-streams through a command
//!   channel. Holding a handle does not keep the session alive, which makes
//!   it safe to stash in routing tables.
//! - [`MuxIncoming`] — yields sub-streams opened by the peer; closes when
//!   the session ends.
//!
//! Sub-streams are tokio-native ([`MuxStream`]); flow control per sub-stream
//! comes from yamux itself.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_util::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tracing::debug;

pub use yamux::Mode;

/// A bidirectional sub-stream multiplexed over the session transport.
pub type MuxStream = Compat<yamux::Stream>;

enum Command {
    Open(oneshot::Sender<io::Result<MuxStream>>),
    Close,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Clonable, non-owning handle for opening outbound sub-streams.
#[derive(Clone, Debug)]
pub struct MuxHandle {
    id: u64,
    cmd_tx: mpsc::Sender<Command>,
}

impl MuxHandle {
    /// Process-unique id of the session this handle belongs to. Lets
    /// bookkeeping tell apart two sessions that bound the same public
    /// identifier in succession.
    #[must_use]
    pub fn session_id(&self) -> u64 {
        self.id
    }

    /// Open a new outbound sub-stream. Fails once the session is gone.
    pub async fn open_stream(&self) -> io::Result<MuxStream> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Open(tx))
            .await
            .map_err(|_| session_closed())?;
        rx.await.map_err(|_| session_closed())?
    }

    /// Ask the driver to close the session. Pending opens fail, the peer
    /// sees a clean shutdown.
    pub async fn close(&self) {
        let _ = self.cmd_tx.send(Command::Close).await;
    }
}

/// Receiver half for sub-streams opened by the peer.
#[derive(Debug)]
pub struct MuxIncoming {
    rx: mpsc::UnboundedReceiver<MuxStream>,
}

impl MuxIncoming {
    /// Next inbound sub-stream, or `None` once the session ended.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await
    }
}

fn session_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "multiplex session closed")
}

/// Start a multiplex session over `io` and return its two halves. The
/// driver task runs until the transport fails or [`MuxHandle::close`] is
/// called.
pub fn spawn<T>(io: T, mode: Mode) -> (MuxHandle, MuxIncoming)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(16);
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let connection = yamux::Connection::new(io, yamux::Config::default(), mode);

    tokio::spawn(drive(connection, cmd_rx, in_tx));

    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
    (MuxHandle { id, cmd_tx }, MuxIncoming { rx: in_rx })
}

async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut cmd_rx: mpsc::Receiver<Command>,
    in_tx: mpsc::UnboundedSender<MuxStream>,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut pending: VecDeque<oneshot::Sender<io::Result<MuxStream>>> = VecDeque::new();
    let mut closing = false;

    poll_fn(move |cx| {
        poll_session(
            &mut connection,
            &mut cmd_rx,
            &in_tx,
            &mut pending,
            &mut closing,
            cx,
        )
    })
    .await;
}

/// One scheduling pass over the whole session: drain open/close commands,
/// progress outbound opens, then pump inbound sub-streams (which also
/// drives all I/O of already-open sub-streams).
fn poll_session<T>(
    connection: &mut yamux::Connection<T>,
    cmd_rx: &mut mpsc::Receiver<Command>,
    in_tx: &mpsc::UnboundedSender<MuxStream>,
    pending: &mut VecDeque<oneshot::Sender<io::Result<MuxStream>>>,
    closing: &mut bool,
    cx: &mut Context<'_>,
) -> Poll<()>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match cmd_rx.poll_recv(cx) {
            Poll::Ready(Some(Command::Open(tx))) => pending.push_back(tx),
            Poll::Ready(Some(Command::Close)) => *closing = true,
            // All handles dropped: keep serving the peer until it goes away.
            Poll::Ready(None) | Poll::Pending => break,
        }
    }

    if *closing {
        for tx in pending.drain(..) {
            let _ = tx.send(Err(session_closed()));
        }
        return match connection.poll_close(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(()),
            Poll::Ready(Err(e)) => {
                debug!("mux close failed: {e}");
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        };
    }

    while let Some(tx) = pending.pop_front() {
        match connection.poll_new_outbound(cx) {
            Poll::Ready(Ok(stream)) => {
                let _ = tx.send(Ok(stream.compat()));
            }
            Poll::Ready(Err(e)) => {
                let _ = tx.send(Err(io::Error::other(e.to_string())));
            }
            Poll::Pending => {
                pending.push_front(tx);
                break;
            }
        }
    }

    loop {
        match connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                // Receiver gone means nobody wants inbound sub-streams;
                // dropping resets them while the session stays up.
                let _ = in_tx.send(stream.compat());
            }
            Poll::Ready(Some(Err(e))) => {
                debug!("mux session failed: {e}");
                for tx in pending.drain(..) {
                    let _ = tx.send(Err(session_closed()));
                }
                return Poll::Ready(());
            }
            Poll::Ready(None) => {
                for tx in pending.drain(..) {
                    let _ = tx.send(Err(session_closed()));
                }
                return Poll::Ready(());
            }
            Poll::Pending => return Poll::Pending,
        }
    }
}
