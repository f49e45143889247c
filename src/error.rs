//! Error types for the wire engine
//!
//! Every fatal condition on a connection is one of a small set of causes.
//! `Error` is `Clone` so that a single cause can be recorded by the byte
//! channel and surfaced on both the producing and the consuming end.

use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for wire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Wire engine error types
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Malformed header, oversize control payload, fragmented control frame,
    /// unexpected continuation, and every other breach of RFC 6455 framing
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// Opcode outside the RFC 6455 table
    #[error("invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Text payload or close reason that is not UTF-8
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// Single frame above the configured frame limit
    #[error("frame too large")]
    FrameTooLarge,

    /// Reassembled message above the configured message limit
    #[error("message too large")]
    MessageTooLarge,

    /// The byte stream ended in the middle of a frame or fragmented message
    #[error("unexpected end of stream")]
    TruncatedStream,

    /// I/O failure or timeout reported by the underlying transport
    #[error("transport failure: {message}")]
    TransportFailure {
        /// What the engine was doing when the transport failed
        message: &'static str,
        /// Original transport error
        #[source]
        source: Arc<io::Error>,
    },

    /// A buffer was recycled into a pool whose slot size it does not match
    #[error("buffer of {actual} bytes recycled into a pool of {expected}-byte slots")]
    BufferPoolMisuse {
        /// Slot size of the pool
        expected: usize,
        /// Length of the rejected buffer
        actual: usize,
    },

    /// A read offered no room while the channel held data
    #[error("zero-length read from a channel holding {buffered} bytes")]
    EmptyReadBuffer {
        /// Bytes waiting in the channel
        buffered: usize,
    },

    /// The byte channel was closed without a cause
    #[error("channel closed")]
    ChannelClosed,

    /// Opening handshake could not be validated
    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),
}

impl Error {
    /// Wrap a transport error into the uniform taxonomy value
    pub fn transport(message: &'static str, source: io::Error) -> Self {
        Error::TransportFailure {
            message,
            source: Arc::new(source),
        }
    }

    /// Whether this error is a breach of the wire protocol by the peer
    #[inline]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_) | Error::InvalidOpcode(_) | Error::InvalidUtf8
        )
    }

    /// Close status code to report to the peer for this error
    pub fn close_code(&self) -> u16 {
        match self {
            Error::ProtocolViolation(_) | Error::InvalidOpcode(_) => CloseReason::PROTOCOL_ERROR,
            Error::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            Error::FrameTooLarge | Error::MessageTooLarge => CloseReason::TOO_BIG,
            Error::BufferPoolMisuse { .. } | Error::EmptyReadBuffer { .. } => {
                CloseReason::INTERNAL
            }
            _ => CloseReason::ABNORMAL,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::transport("transport timed out", e),
            _ => Error::transport("transport I/O failed", e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::TransportFailure { ref source, .. } => io::Error::new(source.kind(), e.to_string()),
            Error::TruncatedStream => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            Error::ChannelClosed => io::Error::new(io::ErrorKind::BrokenPipe, e),
            Error::EmptyReadBuffer { .. } => io::Error::new(io::ErrorKind::InvalidInput, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure, never sent on the wire
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Reason surfaced when the connection ended without a Close frame
    pub fn abnormal() -> Self {
        Self::new(Self::ABNORMAL, "connection closed without a close frame")
    }

    /// Reason to send to the peer after a fatal error
    pub fn from_error(err: &Error) -> Self {
        Self::new(err.close_code(), err.to_string())
    }

    /// Check if the close code may appear on the wire per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}
