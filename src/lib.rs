//! # Sockudo-Wire: WebSocket wire engine over a backpressured byte channel
//!
//! The crate covers the layer between a raw byte transport and WebSocket
//! frames:
//!
//! - **Frames**: an immutable [`Frame`] value with a one-shot release hook
//! - **Codec**: RFC 6455 framing with masking, fragmentation and control-frame
//!   rules ([`codec::FrameReader`], [`codec::FrameWriter`])
//! - **Byte channel**: a bounded, suspending single-producer single-consumer
//!   byte stream ([`channel::channel`])
//! - **Readiness bridge**: drives a callback-style "output ready" transport
//!   from the byte channel ([`bridge::WriteBridge`])
//! - **Buffer pool**: fixed-size reusable buffers shared across connections
//! - **Session**: reader and writer tasks for one connection ([`Session`])
//!
//! ## Example
//!
//! ```no_run
//! use sockudo_wire::prelude::*;
//!
//! # async fn demo() -> sockudo_wire::Result<()> {
//! let config = Config::default();
//! let (tx, rx) = channel(config.channel_capacity);
//!
//! let mut writer = FrameWriter::new(tx, Role::Server);
//! let mut reader = FrameReader::new(rx, Role::Client, &config);
//!
//! writer.write_frame(Frame::text("Hello")).await?;
//! writer.close();
//!
//! let frame = reader.next_frame().await?.expect("one frame");
//! assert_eq!(frame.as_text()?, "Hello");
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod pool;
pub mod session;
pub mod utf8;

pub use bridge::{BridgeHandle, BridgeState, ReadinessListener, ReadinessTransport, WriteBridge};
pub use channel::{ByteReader, ByteWriter, ChannelState, channel};
pub use codec::{FrameReader, FrameWriter, Role};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, FrameType, ReleaseHook};
pub use pool::BufferPool;
pub use session::Session;

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload length encoded inline in the 7-bit length field
pub const SMALL_MESSAGE_THRESHOLD: usize = 125;

/// Largest payload length encoded in the 16-bit extended length field
pub const MEDIUM_MESSAGE_THRESHOLD: usize = 65535;

/// Maximum payload of a control frame
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default byte channel window (64KB)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64 * 1024;

/// Default buffer pool slot size (4KB)
pub const DEFAULT_POOL_SLOT_SIZE: usize = 4096;

/// Default number of buffers the pool retains
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Default number of bytes the bridge copies between cooperative yields (512KB)
pub const DEFAULT_YIELD_THRESHOLD: usize = 512 * 1024;

/// RSV1 bit in the first header byte
pub const RSV1: u8 = 0x40;
/// RSV2 bit in the first header byte
pub const RSV2: u8 = 0x20;
/// RSV3 bit in the first header byte
pub const RSV3: u8 = 0x10;

/// How the frame reader surfaces fragmented messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FragmentMode {
    /// Deliver every fragment as its own frame
    Raw,
    /// Concatenate fragments into one frame with `fin = true`
    #[default]
    Assembled,
}

/// Configuration for a WebSocket connection
///
/// # Example
///
/// ```
/// use sockudo_wire::{Config, FragmentMode};
///
/// let config = Config::builder()
///     .max_message_size(1024 * 1024)
///     .channel_capacity(16 * 1024)
///     .fragment_mode(FragmentMode::Raw)
///     .build();
///
/// assert_eq!(config.max_message_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum single frame payload (default: 16MB)
    pub max_frame_size: usize,
    /// Maximum reassembled message size (default: 64MB)
    pub max_message_size: usize,
    /// Byte channel window in bytes (default: 64KB)
    pub channel_capacity: usize,
    /// Buffer pool slot size (default: 4KB)
    pub pool_slot_size: usize,
    /// Number of buffers the pool keeps around (default: 1024)
    pub pool_capacity: usize,
    /// Bytes the bridge copies before yielding to the scheduler (default: 512KB)
    pub yield_threshold: usize,
    /// Fragment delivery mode (default: Assembled)
    pub fragment_mode: FragmentMode,
    /// RSV bits an extension has negotiated, as a mask over the first header
    /// byte (default: none)
    pub reserved_bits: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            pool_slot_size: DEFAULT_POOL_SLOT_SIZE,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            yield_threshold: DEFAULT_YIELD_THRESHOLD,
            fragment_mode: FragmentMode::Assembled,
            reserved_bits: 0,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for connection configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the byte channel window
    pub fn channel_capacity(mut self, size: usize) -> Self {
        self.config.channel_capacity = size.max(1);
        self
    }

    /// Set the pool slot size and the number of retained buffers
    pub fn pool(mut self, slot_size: usize, capacity: usize) -> Self {
        self.config.pool_slot_size = slot_size.max(1);
        self.config.pool_capacity = capacity;
        self
    }

    /// Set how many bytes the bridge copies between yields
    pub fn yield_threshold(mut self, bytes: usize) -> Self {
        self.config.yield_threshold = bytes;
        self
    }

    /// Set fragment delivery mode
    pub fn fragment_mode(mut self, mode: FragmentMode) -> Self {
        self.config.fragment_mode = mode;
        self
    }

    /// Allow RSV bits negotiated by an extension (any of [`RSV1`], [`RSV2`], [`RSV3`])
    pub fn reserved_bits(mut self, mask: u8) -> Self {
        self.config.reserved_bits = mask & (RSV1 | RSV2 | RSV3);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::bridge::{BridgeHandle, BridgeState, ReadinessListener, ReadinessTransport, WriteBridge};
    pub use crate::channel::{ByteReader, ByteWriter, channel};
    pub use crate::codec::{FrameReader, FrameWriter, Role};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, FrameType, ReleaseHook};
    pub use crate::pool::BufferPool;
    pub use crate::session::Session;
    pub use crate::{Config, FragmentMode};
}
