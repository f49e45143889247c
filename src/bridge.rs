//! Write-readiness bridge
//!
//! Some transports do not expose a future-based write. Instead they report
//! "you may write now" through a callback and reject writes until then. The
//! [`WriteBridge`] drains a byte channel into such a transport: it waits for a
//! readiness signal before every write and flush, and surfaces transport
//! failures as a cancellation of the channel so the producer stops too.
//!
//! ```text
//! producer -> ByteWriter -> [channel] -> ByteReader -> WriteBridge -> transport
//!                                                          ^              |
//!                                                          +-- listener --+
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::Config;
use crate::channel::{ByteReader, CancelHandle};
use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// Pending readiness signals; one is enough to wake the bridge
const EVENT_QUEUE_CAPACITY: usize = 2;

/// Output transport driven by readiness callbacks
///
/// The transport must call [`ReadinessListener::on_write_possible`] whenever it
/// becomes able to accept a write, including once right after the listener is
/// installed if it is already writable.
pub trait ReadinessTransport: Send {
    /// Install the listener the transport reports readiness and errors to
    fn set_listener(&mut self, listener: ReadinessListener);

    /// Whether a write or flush may be issued now
    fn is_ready(&self) -> bool;

    /// Write the whole buffer; only called while `is_ready()` is true
    fn write(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Flush written bytes; only called while `is_ready()` is true
    fn flush(&mut self) -> io::Result<()>;
}

/// Observable phase of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    /// Created, not yet running
    Idle = 0,
    /// Waiting for the transport to become writable
    AwaitingReady = 1,
    /// Moving bytes from the channel to the transport
    Writing = 2,
    /// Channel exhausted, issuing the final flush
    Finishing = 3,
    /// Every byte written and flushed
    Done = 4,
    /// Failed; see [`BridgeHandle::failure`]
    Error = 5,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => BridgeState::Idle,
            1 => BridgeState::AwaitingReady,
            2 => BridgeState::Writing,
            3 => BridgeState::Finishing,
            4 => BridgeState::Done,
            _ => BridgeState::Error,
        }
    }

    /// Whether the bridge has stopped
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Done | BridgeState::Error)
    }
}

struct BridgeShared {
    state: AtomicU8,
    draining: AtomicBool,
    failure: Mutex<Option<Error>>,
    channel: CancelHandle,
}

impl BridgeShared {
    fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, next: BridgeState) {
        let result = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!BridgeState::from_u8(current).is_terminal()).then_some(next as u8)
            });
        if let Ok(previous) = result {
            let previous = BridgeState::from_u8(previous);
            if previous != next {
                tracing::trace!(from = ?previous, to = ?next, "bridge state");
            }
        }
    }

    fn failure(&self) -> Option<Error> {
        self.failure.lock().clone()
    }

    /// Record the first failure, cancel the channel and stop the bridge
    ///
    /// A bridge that already finished keeps its outcome.
    fn fail(&self, err: Error) -> Error {
        let err = {
            let mut failure = self.failure.lock();
            if let Some(existing) = failure.as_ref() {
                return existing.clone();
            }
            if self.state() == BridgeState::Done {
                return err;
            }
            failure.insert(err).clone()
        };
        self.set_state(BridgeState::Error);
        self.channel.cancel(err.clone());
        err
    }
}

/// Callbacks handed to the transport
///
/// Neither callback blocks on the async path: a readiness signal that does
/// not fit in the queue is dropped, because a queued signal is already
/// pending.
#[derive(Clone)]
pub struct ReadinessListener {
    events: mpsc::Sender<()>,
    shared: Arc<BridgeShared>,
}

impl ReadinessListener {
    /// The transport can accept a write
    pub fn on_write_possible(&self) {
        if self.shared.state().is_terminal() {
            return;
        }
        match self.events.try_send(()) {
            Ok(()) | Err(TrySendError::Closed(())) => {}
            Err(TrySendError::Full(())) => {
                // off the runtime during the final flush, wait for room
                // instead of dropping the confirmation
                if self.shared.draining.load(Ordering::Acquire)
                    && tokio::runtime::Handle::try_current().is_err()
                {
                    let _ = self.events.blocking_send(());
                }
            }
        }
    }

    /// The transport failed; the error is final and never retried
    pub fn on_error(&self, error: io::Error) {
        if self.shared.state().is_terminal() {
            tracing::debug!(%error, "transport error after the bridge stopped");
            return;
        }
        let err = self
            .shared
            .fail(Error::transport("readiness transport reported an error", error));
        tracing::warn!(error = %err, "readiness transport failed");
        let _ = self.events.try_send(());
    }
}

impl std::fmt::Debug for ReadinessListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessListener")
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Observes a bridge from outside
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<BridgeShared>,
}

impl BridgeHandle {
    /// Current phase
    pub fn state(&self) -> BridgeState {
        self.shared.state()
    }

    /// The error that stopped the bridge, if any
    pub fn failure(&self) -> Option<Error> {
        self.shared.failure()
    }
}

impl std::fmt::Debug for BridgeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeHandle")
            .field("state", &self.state())
            .finish()
    }
}

/// Drains a byte channel into a readiness-driven transport
pub struct WriteBridge<T> {
    transport: T,
    channel: ByteReader,
    events: mpsc::Receiver<()>,
    listener: Option<ReadinessListener>,
    shared: Arc<BridgeShared>,
    pool: Arc<BufferPool>,
    yield_threshold: usize,
}

impl<T: ReadinessTransport> WriteBridge<T> {
    /// Create a bridge; nothing happens until [`run`](WriteBridge::run)
    pub fn new(transport: T, channel: ByteReader, pool: Arc<BufferPool>, config: &Config) -> Self {
        let (tx, events) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let shared = Arc::new(BridgeShared {
            state: AtomicU8::new(BridgeState::Idle as u8),
            draining: AtomicBool::new(false),
            failure: Mutex::new(None),
            channel: channel.cancel_handle(),
        });
        Self {
            transport,
            channel,
            events,
            listener: Some(ReadinessListener {
                events: tx,
                shared: shared.clone(),
            }),
            shared,
            pool,
            yield_threshold: config.yield_threshold,
        }
    }

    /// Handle for observing the bridge state
    pub fn handle(&self) -> BridgeHandle {
        BridgeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Copy the channel into the transport until the producer closes it
    ///
    /// The pooled buffer is recycled only on success; after a failure the
    /// transport may still hold it.
    pub async fn run(mut self) -> Result<()> {
        let mut buffer = self.pool.borrow();

        if let Some(listener) = self.listener.take() {
            self.transport.set_listener(listener);
        }

        let result = self.drive(&mut buffer).await;
        self.events.close();

        match result {
            Ok(()) => {
                self.shared.set_state(BridgeState::Done);
                self.pool.recycle(buffer)?;
                Ok(())
            }
            Err(err) => {
                let err = self.shared.fail(err);
                tracing::warn!(error = %err, "write bridge failed");
                Err(err)
            }
        }
    }

    async fn drive(&mut self, buffer: &mut [u8]) -> Result<()> {
        self.next_event().await?;
        self.copy_loop(buffer).await?;
        self.finish().await
    }

    async fn copy_loop(&mut self, buffer: &mut [u8]) -> Result<()> {
        if self.channel.available_for_read() == 0 {
            self.await_ready().await?;
            self.flush()?;
        }

        let mut copied = 0usize;
        loop {
            let n = self.channel.read(buffer).await?;
            if n == 0 {
                break;
            }

            copied += n;
            if copied > self.yield_threshold {
                copied = 0;
                tokio::task::yield_now().await;
            }

            self.await_ready().await?;
            self.shared.set_state(BridgeState::Writing);
            self.transport
                .write(&buffer[..n])
                .map_err(|e| Error::transport("failed to write to the readiness transport", e))?;
            self.await_ready().await?;

            if self.channel.available_for_read() == 0 {
                self.flush()?;
            }
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.shared.draining.store(true, Ordering::Release);
        self.shared.set_state(BridgeState::Finishing);
        self.await_ready().await?;
        self.flush()?;
        self.await_ready().await
    }

    fn flush(&mut self) -> Result<()> {
        self.transport
            .flush()
            .map_err(|e| Error::transport("failed to flush the readiness transport", e))
    }

    async fn await_ready(&mut self) -> Result<()> {
        self.check_failure()?;
        while !self.transport.is_ready() {
            self.next_event().await?;
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<()> {
        if !self.shared.draining.load(Ordering::Acquire) {
            self.shared.set_state(BridgeState::AwaitingReady);
        }
        match self.events.recv().await {
            Some(()) => self.check_failure(),
            None => {
                self.check_failure()?;
                Err(Error::transport(
                    "readiness listener dropped",
                    io::Error::new(io::ErrorKind::BrokenPipe, "transport released its listener"),
                ))
            }
        }
    }

    fn check_failure(&self) -> Result<()> {
        match self.shared.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<T> std::fmt::Debug for WriteBridge<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBridge")
            .field("state", &self.shared.state())
            .field("yield_threshold", &self.yield_threshold)
            .finish()
    }
}
