//! Frame codec over the byte channel
//!
//! [`FrameReader`] turns a [`ByteReader`](crate::channel::ByteReader) into a
//! stream of frames and [`FrameWriter`] serializes frames into a
//! [`ByteWriter`](crate::channel::ByteWriter).

pub mod header;
mod reader;
mod writer;

pub use header::{FrameHeader, FrameParser, OpCode};
pub use reader::FrameReader;
pub use writer::FrameWriter;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

impl Role {
    /// Whether frames arriving at this endpoint must be masked
    #[inline]
    pub fn expects_masked_input(self) -> bool {
        self == Role::Server
    }

    /// Whether frames sent by this endpoint are masked
    #[inline]
    pub fn masks_output(self) -> bool {
        self == Role::Client
    }
}
