//! WebSocket frame value type
//!
//! A [`Frame`] is immutable once built. Constructors enforce the invariants
//! that belong to the frame itself (control frames are never fragmented, a
//! Close payload is a status code plus a UTF-8 reason); the payload limit
//! for control frames belongs to the codec.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::utf8::validate_utf8;

/// Type of a WebSocket frame
///
/// Continuation (opcode `0x0`) is a wire detail of fragmentation and is not a
/// frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl FrameType {
    /// Map a wire opcode to a frame type
    #[inline]
    pub fn from_opcode(opcode: u8) -> Option<Self> {
        match opcode {
            0x1 => Some(FrameType::Text),
            0x2 => Some(FrameType::Binary),
            0x8 => Some(FrameType::Close),
            0x9 => Some(FrameType::Ping),
            0xA => Some(FrameType::Pong),
            _ => None,
        }
    }

    /// Wire opcode of this type
    #[inline]
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Check if this is a control frame type
    #[inline]
    pub fn is_control(self) -> bool {
        (self as u8) >= 0x8
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameType::Text => "TEXT",
            FrameType::Binary => "BINARY",
            FrameType::Close => "CLOSE",
            FrameType::Ping => "PING",
            FrameType::Pong => "PONG",
        };
        f.write_str(name)
    }
}

/// One-shot callback run when a frame's payload may be reclaimed
///
/// The callback runs at most once: on [`Frame::release`], or when the frame
/// (or the hook itself) is dropped.
pub struct ReleaseHook(Option<Box<dyn FnOnce() + Send + 'static>>);

impl ReleaseHook {
    /// Wrap a callback
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A hook that does nothing
    pub fn noop() -> Self {
        Self(None)
    }

    fn fire(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Default for ReleaseHook {
    fn default() -> Self {
        Self::noop()
    }
}

impl Drop for ReleaseHook {
    fn drop(&mut self) {
        self.fire();
    }
}

impl fmt::Debug for ReleaseHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.0.is_some() {
            "ReleaseHook(pending)"
        } else {
            "ReleaseHook(none)"
        })
    }
}

/// A WebSocket frame
#[derive(Debug)]
pub struct Frame {
    fin: bool,
    frame_type: FrameType,
    rsv1: bool,
    rsv2: bool,
    rsv3: bool,
    payload: Bytes,
    hook: ReleaseHook,
}

impl Frame {
    fn raw(fin: bool, frame_type: FrameType, payload: Bytes, rsv: (bool, bool, bool)) -> Self {
        Self {
            fin,
            frame_type,
            rsv1: rsv.0,
            rsv2: rsv.1,
            rsv3: rsv.2,
            payload,
            hook: ReleaseHook::noop(),
        }
    }

    /// Create a final text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::raw(true, FrameType::Text, data.into(), (false, false, false))
    }

    /// Create a text fragment; `fin = false` opens or continues a message
    #[inline]
    pub fn text_fragment(fin: bool, data: impl Into<Bytes>) -> Self {
        Self::raw(fin, FrameType::Text, data.into(), (false, false, false))
    }

    /// Create a final binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::raw(true, FrameType::Binary, data.into(), (false, false, false))
    }

    /// Create a binary fragment; `fin = false` opens or continues a message
    #[inline]
    pub fn binary_fragment(fin: bool, data: impl Into<Bytes>) -> Self {
        Self::raw(fin, FrameType::Binary, data.into(), (false, false, false))
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::raw(true, FrameType::Ping, data.into(), (false, false, false))
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::raw(true, FrameType::Pong, data.into(), (false, false, false))
    }

    /// Create a close frame, empty when no reason is given
    pub fn close(reason: Option<CloseReason>) -> Self {
        let payload = match reason {
            Some(reason) => {
                let mut buf = BytesMut::with_capacity(2 + reason.reason.len());
                buf.put_u16(reason.code);
                buf.put_slice(reason.reason.as_bytes());
                buf.freeze()
            }
            None => Bytes::new(),
        };
        Self::raw(true, FrameType::Close, payload, (false, false, false))
    }

    /// Create a close frame from an already encoded payload
    pub fn close_raw(data: impl Into<Bytes>) -> Result<Self> {
        let payload = data.into();
        validate_close_payload(&payload)?;
        Ok(Self::raw(true, FrameType::Close, payload, (false, false, false)))
    }

    /// Build a frame of any type, validating per-type invariants
    pub fn by_type(
        fin: bool,
        frame_type: FrameType,
        data: impl Into<Bytes>,
        rsv1: bool,
        rsv2: bool,
        rsv3: bool,
    ) -> Result<Self> {
        if frame_type.is_control() && !fin {
            return Err(Error::ProtocolViolation("control frame must not be fragmented"));
        }
        let payload = data.into();
        if frame_type == FrameType::Close {
            validate_close_payload(&payload)?;
        }
        Ok(Self::raw(fin, frame_type, payload, (rsv1, rsv2, rsv3)))
    }

    /// Build a frame from a wire opcode
    ///
    /// The continuation opcode and the reserved opcodes are rejected.
    pub fn from_opcode(
        fin: bool,
        opcode: u8,
        data: impl Into<Bytes>,
        rsv1: bool,
        rsv2: bool,
        rsv3: bool,
    ) -> Result<Self> {
        let frame_type = FrameType::from_opcode(opcode).ok_or(Error::InvalidOpcode(opcode))?;
        Self::by_type(fin, frame_type, data, rsv1, rsv2, rsv3)
    }

    /// Attach a release hook, replacing (and firing) any previous one
    pub fn with_release_hook(mut self, hook: ReleaseHook) -> Self {
        self.hook = hook;
        self
    }

    /// Deep copy with a detached release hook
    pub fn copy(&self) -> Self {
        Self::raw(
            self.fin,
            self.frame_type,
            Bytes::copy_from_slice(&self.payload),
            (self.rsv1, self.rsv2, self.rsv3),
        )
    }

    /// Signal that the payload may be reclaimed
    #[inline]
    pub fn release(self) {
        drop(self);
    }

    /// Final fragment flag
    #[inline]
    pub fn fin(&self) -> bool {
        self.fin
    }

    /// Frame type
    #[inline]
    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Reserved bits `(rsv1, rsv2, rsv3)`
    #[inline]
    pub fn rsv(&self) -> (bool, bool, bool) {
        (self.rsv1, self.rsv2, self.rsv3)
    }

    /// Frame payload
    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Payload length
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.frame_type.is_control()
    }

    /// Get the payload as a string
    pub fn as_text(&self) -> Result<&str> {
        simdutf8::basic::from_utf8(&self.payload).map_err(|_| Error::InvalidUtf8)
    }

    /// Parse the status code and reason of a Close frame
    ///
    /// Returns `None` for other frame types and for an empty Close payload.
    pub fn close_reason(&self) -> Option<CloseReason> {
        if self.frame_type != FrameType::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some(CloseReason::new(code, reason))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame {} (fin={}, buffer len = {})",
            self.frame_type,
            self.fin,
            self.payload.len()
        )
    }
}

/// Check the layout of a Close payload: empty, or a status code followed by a
/// UTF-8 reason
pub(crate) fn validate_close_payload(payload: &[u8]) -> Result<()> {
    match payload.len() {
        0 => Ok(()),
        1 => Err(Error::ProtocolViolation("close payload must start with a 2-byte status code")),
        _ if validate_utf8(&payload[2..]) => Ok(()),
        _ => Err(Error::InvalidUtf8),
    }
}
