//! WebSocket-as-byte-stream adapter.
//!
//! The multiplexer wants a plain byte stream, while both ends of the relay
//! connection speak WebSocket (axum on the server, tungstenite on the
//! agent). [`WsByteStream`] bridges the two: writes become binary messages,
//! binary/text payloads concatenate into the read side, a close frame is
//! end-of-stream. The message types differ per library, so each binary
//! provides a tiny [`WsFrame`] impl for its own type.

use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::io::{AsyncRead, AsyncWrite};
use futures_util::{Sink, Stream};

/// What a received WebSocket message contributes to the byte stream.
pub enum WsPayload {
    /// Text or binary payload bytes.
    Data(Vec<u8>),
    /// Ping/pong; answered by the WebSocket stack, skipped here.
    Control,
    /// Close frame: end of stream.
    Close,
}

/// Minimal view of a WebSocket message type.
pub trait WsFrame: Sized + Send + 'static {
    /// Build a binary message carrying `data`.
    fn binary(data: Vec<u8>) -> Self;
    /// Classify a received message.
    fn into_payload(self) -> WsPayload;
}

/// Adapter exposing a WebSocket `Stream + Sink` as `AsyncRead + AsyncWrite`.
pub struct WsByteStream<S, M> {
    inner: S,
    read_buf: Vec<u8>,
    read_pos: usize,
    _frame: PhantomData<M>,
}

impl<S, M> WsByteStream<S, M> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            _frame: PhantomData,
        }
    }
}

fn ws_io_err(e: impl fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())
}

impl<S, M, E> AsyncRead for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: WsFrame + Unpin,
    E: fmt::Display,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = (this.read_buf.len() - this.read_pos).min(buf.len());
                buf[..n].copy_from_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                if this.read_pos == this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(n));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(msg)) => match msg.into_payload() {
                    WsPayload::Data(data) => {
                        if data.is_empty() {
                            continue;
                        }
                        this.read_buf = data;
                        this.read_pos = 0;
                    }
                    WsPayload::Control => {}
                    WsPayload::Close => return Poll::Ready(Ok(0)),
                },
                Some(Err(e)) => return Poll::Ready(Err(ws_io_err(e))),
                None => return Poll::Ready(Ok(0)),
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsByteStream<S, M>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: WsFrame + Unpin,
    E: fmt::Display,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_io_err)?;
        Pin::new(&mut this.inner)
            .start_send(M::binary(buf.to_vec()))
            .map_err(ws_io_err)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_io_err)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_close(cx).map_err(ws_io_err)
    }
}

#[cfg(feature = "axum-transport")]
impl WsFrame for axum::extract::ws::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }

    fn into_payload(self) -> WsPayload {
        match self {
            Self::Binary(data) => WsPayload::Data(data.to_vec()),
            Self::Text(text) => WsPayload::Data(text.as_bytes().to_vec()),
            Self::Close(_) => WsPayload::Close,
            _ => WsPayload::Control,
        }
    }
}

#[cfg(feature = "tungstenite-transport")]
impl WsFrame for tokio_tungstenite::tungstenite::Message {
    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data.into())
    }

    fn into_payload(self) -> WsPayload {
        match self {
            Self::Binary(data) => WsPayload::Data(data.to_vec()),
            Self::Text(text) => WsPayload::Data(text.as_bytes().to_vec()),
            Self::Close(_) => WsPayload::Close,
            _ => WsPayload::Control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::io::{AsyncReadExt, AsyncWriteExt};
    use std::collections::VecDeque;

    /// Test double standing in for a WebSocket message type.
    #[derive(Debug, PartialEq)]
    enum FakeMessage {
        Binary(Vec<u8>),
        Ping,
        Close,
    }

    impl WsFrame for FakeMessage {
        fn binary(data: Vec<u8>) -> Self {
            Self::Binary(data)
        }

        fn into_payload(self) -> WsPayload {
            match self {
                Self::Binary(data) => WsPayload::Data(data),
                Self::Ping => WsPayload::Control,
                Self::Close => WsPayload::Close,
            }
        }
    }

    /// In-memory stream+sink of fake messages.
    struct FakeSocket {
        incoming: VecDeque<FakeMessage>,
        sent: Vec<FakeMessage>,
    }

    impl Stream for FakeSocket {
        type Item = Result<FakeMessage, std::convert::Infallible>;

        fn poll_next(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Self::Item>> {
            Poll::Ready(self.get_mut().incoming.pop_front().map(Ok))
        }
    }

    impl Sink<FakeMessage> for FakeSocket {
        type Error = std::convert::Infallible;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: FakeMessage) -> Result<(), Self::Error> {
            self.get_mut().sent.push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_concatenates_and_skips_control_frames() {
        let socket = FakeSocket {
            incoming: VecDeque::from([
                FakeMessage::Binary(b"ab".to_vec()),
                FakeMessage::Ping,
                FakeMessage::Binary(b"cd".to_vec()),
                FakeMessage::Close,
            ]),
            sent: Vec::new(),
        };
        let mut adapter = WsByteStream::<_, FakeMessage>::new(socket);

        let mut collected = Vec::new();
        adapter.read_to_end(&mut collected).await.unwrap();
        assert_eq!(collected, b"abcd");
    }

    #[tokio::test]
    async fn test_writes_become_binary_messages() {
        let socket = FakeSocket {
            incoming: VecDeque::new(),
            sent: Vec::new(),
        };
        let mut adapter = WsByteStream::<_, FakeMessage>::new(socket);
        adapter.write_all(b"payload").await.unwrap();
        adapter.flush().await.unwrap();
        assert_eq!(
            adapter.inner.sent,
            vec![FakeMessage::Binary(b"payload".to_vec())]
        );
    }
}
