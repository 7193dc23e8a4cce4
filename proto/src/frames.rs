//! Length-prefixed framing over any reliable byte stream.
//!
//! Every sub-stream carries a sequence of frames: a 4-byte big-endian length
//! followed by exactly that many payload bytes. Length 0 is a legal empty
//! frame, used by the streaming adapters as an end-of-stream marker. Frames
//! larger than 16 MiB are rejected on both sides.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Maximum frame payload size.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Errors produced by frame and JSON envelope I/O.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Frame length header exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the 16 MiB limit")]
    TooLarge(u64),
    /// An empty frame arrived where a JSON envelope was expected. Peers send
    /// an empty frame to mark the end of a framed stream.
    #[error("unexpected empty frame")]
    Empty,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write one frame: 4-byte big-endian length, then the payload.
pub async fn write_frame<W>(w: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len() as u64))?;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(u64::from(len)));
    }
    w.write_all(&len.to_be_bytes()).await?;
    if !payload.is_empty() {
        w.write_all(payload).await?;
    }
    w.flush().await?;
    Ok(())
}

/// Read one frame. An empty frame yields an empty `Vec`; end of stream
/// surfaces as an [`io::ErrorKind::UnexpectedEof`] error instead, so the two
/// are distinguishable.
pub async fn read_frame<R>(r: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    r.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header);
    if len == 0 {
        return Ok(Vec::new());
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(u64::from(len)));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame holding the UTF-8 JSON encoding of `value`.
pub async fn write_json<W, T>(w: &mut W, value: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    write_frame(w, &payload).await
}

/// Read one JSON frame into `T`. Unknown fields are ignored; an empty frame
/// is reported as [`FrameError::Empty`].
pub async fn read_json<R, T>(r: &mut R) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(r).await?;
    if payload.is_empty() {
        return Err(FrameError::Empty);
    }
    Ok(serde_json::from_slice(&payload)?)
}

/// Presents successive frames from `inner` as one continuous byte stream,
/// ending at the first empty frame.
pub struct FrameReader<R> {
    inner: R,
    header: [u8; 4],
    header_filled: usize,
    remaining: usize,
    done: bool,
}

impl<R> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            header: [0u8; 4],
            header_filled: 0,
            remaining: 0,
            done: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for FrameReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.done || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if this.remaining == 0 {
            while this.header_filled < 4 {
                let mut hdr = ReadBuf::new(&mut this.header[this.header_filled..]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut hdr))?;
                let n = hdr.filled().len();
                if n == 0 {
                    return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                }
                this.header_filled += n;
            }
            this.header_filled = 0;
            let len = u32::from_be_bytes(this.header);
            if len == 0 {
                this.done = true;
                return Poll::Ready(Ok(()));
            }
            if len > MAX_FRAME_LEN {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    FrameError::TooLarge(u64::from(len)).to_string(),
                )));
            }
            this.remaining = len as usize;
        }

        let take = this.remaining.min(buf.remaining());
        let dst = buf.initialize_unfilled_to(take);
        let mut chunk = ReadBuf::new(dst);
        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk))?;
        let n = chunk.filled().len();
        if n == 0 {
            return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
        }
        buf.advance(n);
        this.remaining -= n;
        Poll::Ready(Ok(()))
    }
}

/// Emits each application write as its own frame; `shutdown` writes the
/// empty terminator frame before shutting the inner writer down.
pub struct FrameWriter<W> {
    inner: W,
    buf: Vec<u8>,
    written: usize,
    terminated: bool,
}

impl<W> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            written: 0,
            terminated: false,
        }
    }
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Drain any buffered frame bytes into the inner writer.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.written < self.buf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.buf[self.written..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.written += n;
        }
        self.buf.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FrameWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        let Ok(len) = u32::try_from(data.len()) else {
            return Poll::Ready(Err(io::ErrorKind::InvalidInput.into()));
        };
        if len > MAX_FRAME_LEN {
            return Poll::Ready(Err(io::ErrorKind::InvalidInput.into()));
        }
        this.buf.extend_from_slice(&len.to_be_bytes());
        this.buf.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if !this.terminated {
            this.buf.extend_from_slice(&0u32.to_be_bytes());
            this.terminated = true;
            ready!(this.poll_drain(cx))?;
        }
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
