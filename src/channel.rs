//! Bounded, suspending byte channel
//!
//! A single-producer single-consumer byte stream with an in-memory window.
//! Writes suspend while the window is full and reads suspend while it is
//! empty. Closing and cancelling move both halves to a terminal state:
//!
//! - `close(cause)` lets the consumer drain buffered bytes first, then reports
//!   end of stream (no cause) or the cause
//! - `cancel(cause)` discards buffered bytes and fails both sides immediately
//!
//! Both halves implement tokio's `AsyncRead`/`AsyncWrite`, and the pump
//! functions move bytes between the channel and a socket.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BytesMut};
use futures_util::future::poll_fn;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// Lifecycle of a byte channel
#[derive(Debug, Clone)]
pub enum ChannelState {
    /// Both sides may transfer bytes
    Open,
    /// Closed with bytes still buffered for the consumer
    Closing(Option<Error>),
    /// Terminal; buffered bytes are gone
    Closed(Option<Error>),
}

impl ChannelState {
    /// Cause recorded when the channel was closed, if any
    pub fn cause(&self) -> Option<&Error> {
        match self {
            ChannelState::Open => None,
            ChannelState::Closing(cause) | ChannelState::Closed(cause) => cause.as_ref(),
        }
    }
}

struct Inner {
    buf: BytesMut,
    capacity: usize,
    state: ChannelState,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Inner {
    /// Error a producer sees once the channel is no longer open
    fn write_error(&self) -> Option<Error> {
        match &self.state {
            ChannelState::Open => None,
            ChannelState::Closing(cause) | ChannelState::Closed(cause) => {
                Some(cause.clone().unwrap_or(Error::ChannelClosed))
            }
        }
    }

    fn finish_drain(&mut self) {
        if !self.buf.is_empty() || !matches!(self.state, ChannelState::Closing(_)) {
            return;
        }
        if let ChannelState::Closing(cause) = std::mem::replace(&mut self.state, ChannelState::Open) {
            self.state = ChannelState::Closed(cause);
        }
    }

    fn close(&mut self, cause: Option<Error>) -> bool {
        if !matches!(self.state, ChannelState::Open) {
            return false;
        }
        self.state = if self.buf.is_empty() {
            ChannelState::Closed(cause)
        } else {
            ChannelState::Closing(cause)
        };
        true
    }

    fn cancel(&mut self, cause: Error) -> bool {
        let cause = match &self.state {
            ChannelState::Closed(_) => return false,
            // a cause recorded by an earlier close wins
            ChannelState::Closing(Some(existing)) => existing.clone(),
            ChannelState::Open | ChannelState::Closing(None) => cause,
        };
        self.buf.clear();
        self.state = ChannelState::Closed(Some(cause));
        true
    }

    fn take_wakers(&mut self) -> [Option<Waker>; 2] {
        [self.read_waker.take(), self.write_waker.take()]
    }
}

struct Shared {
    inner: Mutex<Inner>,
}

impl Shared {
    fn close(&self, cause: Option<Error>) {
        let mut inner = self.inner.lock();
        if !inner.close(cause) {
            return;
        }
        tracing::debug!(
            buffered = inner.buf.len(),
            cause = ?inner.state.cause(),
            "byte channel closed"
        );
        let wakers = inner.take_wakers();
        drop(inner);
        wakers.into_iter().flatten().for_each(Waker::wake);
    }

    fn cancel(&self, cause: Error) {
        let mut inner = self.inner.lock();
        let discarded = inner.buf.len();
        if !inner.cancel(cause) {
            return;
        }
        tracing::debug!(discarded, cause = ?inner.state.cause(), "byte channel cancelled");
        let wakers = inner.take_wakers();
        drop(inner);
        wakers.into_iter().flatten().for_each(Waker::wake);
    }

    fn state(&self) -> ChannelState {
        self.inner.lock().state.clone()
    }

    fn buffered(&self) -> usize {
        self.inner.lock().buf.len()
    }

    fn is_closed(&self) -> bool {
        matches!(self.inner.lock().state, ChannelState::Closed(_))
    }
}

/// Create a byte channel with a window of `capacity` bytes
pub fn channel(capacity: usize) -> (ByteWriter, ByteReader) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            buf: BytesMut::with_capacity(capacity.min(64 * 1024)),
            capacity,
            state: ChannelState::Open,
            read_waker: None,
            write_waker: None,
        }),
    });
    (
        ByteWriter {
            shared: shared.clone(),
        },
        ByteReader { shared },
    )
}

/// Cancels a channel from outside both halves, e.g. from a transport callback
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Cancel the channel with `cause`
    pub fn cancel(&self, cause: Error) {
        self.shared.cancel(cause);
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle").finish_non_exhaustive()
    }
}

/// Producing half of a byte channel
///
/// Dropping the writer closes the channel cleanly.
pub struct ByteWriter {
    shared: Arc<Shared>,
}

impl ByteWriter {
    /// Append as many bytes as the window allows
    ///
    /// Returns `Pending` while the window is full.
    pub fn poll_write_slice(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<Result<usize>> {
        let mut inner = self.shared.inner.lock();
        if let Some(err) = inner.write_error() {
            return Poll::Ready(Err(err));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let space = inner.capacity - inner.buf.len();
        if space == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = space.min(data.len());
        inner.buf.extend_from_slice(&data[..n]);
        let waker = inner.read_waker.take();
        drop(inner);
        if let Some(waker) = waker {
            waker.wake();
        }
        Poll::Ready(Ok(n))
    }

    /// Write all of `data`, suspending while the window is full
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            let n = poll_fn(|cx| self.poll_write_slice(cx, &data[written..])).await?;
            written += n;
        }
        Ok(())
    }

    /// Close the channel; buffered bytes are still delivered
    pub fn close(&self, cause: Option<Error>) {
        self.shared.close(cause);
    }

    /// Cancel the channel, discarding buffered bytes
    pub fn cancel(&self, cause: Error) {
        self.shared.cancel(cause);
    }

    /// Handle that can cancel the channel without owning a half
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Bytes written but not yet read
    pub fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    /// Whether the channel reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }
}

impl Drop for ByteWriter {
    fn drop(&mut self) {
        self.shared.close(None);
    }
}

impl std::fmt::Debug for ByteWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteWriter")
            .field("state", &self.state())
            .finish()
    }
}

/// Consuming half of a byte channel
///
/// Dropping the reader cancels the channel, failing the producer.
pub struct ByteReader {
    shared: Arc<Shared>,
}

impl ByteReader {
    /// Move up to `max` buffered bytes into `sink`
    ///
    /// `Ok(0)` always means end of stream; a zero `max` with bytes buffered
    /// is `EmptyReadBuffer`.
    fn poll_consume(
        &self,
        cx: &mut Context<'_>,
        max: usize,
        sink: impl FnOnce(&[u8]),
    ) -> Poll<Result<usize>> {
        let mut inner = self.shared.inner.lock();

        if !inner.buf.is_empty() {
            if max == 0 {
                return Poll::Ready(Err(Error::EmptyReadBuffer {
                    buffered: inner.buf.len(),
                }));
            }
            let n = max.min(inner.buf.len());
            sink(&inner.buf[..n]);
            inner.buf.advance(n);
            inner.finish_drain();
            let waker = inner.write_waker.take();
            drop(inner);
            if let Some(waker) = waker {
                waker.wake();
            }
            return Poll::Ready(Ok(n));
        }

        if matches!(inner.state, ChannelState::Open) {
            inner.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let result = match inner.state.cause() {
            Some(err) => Err(err.clone()),
            None => Ok(0),
        };
        inner.finish_drain();
        Poll::Ready(result)
    }

    /// Read buffered bytes into `out`
    pub fn poll_read_slice(&self, cx: &mut Context<'_>, out: &mut [u8]) -> Poll<Result<usize>> {
        let max = out.len();
        self.poll_consume(cx, max, |src| out[..src.len()].copy_from_slice(src))
    }

    /// Append up to `max` buffered bytes to `dst`
    pub fn poll_read_buf(
        &self,
        cx: &mut Context<'_>,
        dst: &mut BytesMut,
        max: usize,
    ) -> Poll<Result<usize>> {
        self.poll_consume(cx, max, |src| dst.extend_from_slice(src))
    }

    /// Read into `out`, suspending while the channel is empty and open
    ///
    /// `Ok(0)` is end of stream.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| self.poll_read_slice(cx, out)).await
    }

    /// Fill `out` completely; a premature end of stream is `TruncatedStream`
    pub async fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < out.len() {
            match self.read(&mut out[filled..]).await? {
                0 => return Err(Error::TruncatedStream),
                n => filled += n,
            }
        }
        Ok(())
    }

    /// Close the channel; bytes already buffered may still be read
    pub fn close(&self, cause: Option<Error>) {
        self.shared.close(cause);
    }

    /// Cancel the channel, discarding buffered bytes
    pub fn cancel(&self, cause: Error) {
        self.shared.cancel(cause);
    }

    /// Handle that can cancel the channel without owning a half
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            shared: self.shared.clone(),
        }
    }

    /// Bytes that can be read without suspending
    pub fn available_for_read(&self) -> usize {
        self.shared.buffered()
    }

    /// Whether the channel reached its terminal state
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Current channel state
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }
}

impl Drop for ByteReader {
    fn drop(&mut self) {
        self.shared.cancel(Error::ChannelClosed);
    }
}

impl std::fmt::Debug for ByteReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteReader")
            .field("state", &self.state())
            .finish()
    }
}

impl AsyncRead for ByteReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        let dst = buf.initialize_unfilled();
        match self.poll_read_slice(cx, dst) {
            Poll::Ready(Ok(n)) => {
                buf.advance(n);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for ByteWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_slice(cx, buf).map_err(Into::into)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // written bytes are visible to the reader immediately
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close(None);
        Poll::Ready(Ok(()))
    }
}

/// Copy a socket's input into the channel until EOF
///
/// EOF closes the channel cleanly; a socket error cancels it with
/// `TransportFailure`. Returns the number of bytes moved.
pub async fn pump_from<R>(mut source: R, mut sink: ByteWriter, pool: &BufferPool) -> Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut buf = pool.borrow();
    let mut total = 0u64;

    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                let err = Error::transport("socket read failed", e);
                tracing::warn!(error = %err, "inbound pump failed");
                sink.cancel(err.clone());
                return Err(err);
            }
        };
        sink.write(&buf[..n]).await?;
        total += n as u64;
    }

    sink.close(None);
    pool.recycle(buf)?;
    Ok(total)
}

/// Copy the channel into a socket until the producer closes it
///
/// The socket is flushed whenever the channel runs dry, and shut down at end
/// of stream. A socket error cancels the channel with `TransportFailure`.
pub async fn pump_into<W>(mut source: ByteReader, mut sink: W, pool: &BufferPool) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = pool.borrow();
    let mut total = 0u64;

    loop {
        let n = source.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        if let Err(e) = sink.write_all(&buf[..n]).await {
            return Err(fail_outbound(&source, "socket write failed", e));
        }
        total += n as u64;

        if source.available_for_read() == 0 {
            if let Err(e) = sink.flush().await {
                return Err(fail_outbound(&source, "socket flush failed", e));
            }
        }
    }

    if let Err(e) = sink.shutdown().await {
        return Err(fail_outbound(&source, "socket shutdown failed", e));
    }
    pool.recycle(buf)?;
    Ok(total)
}

fn fail_outbound(source: &ByteReader, message: &'static str, e: io::Error) -> Error {
    let err = Error::transport(message, e);
    tracing::warn!(error = %err, "outbound pump failed");
    source.cancel(err.clone());
    err
}
