//! Frame writer: frames to byte channel

use bytes::{Bytes, BytesMut};

use super::Role;
use super::header::{FrameHeader, OpCode};
use crate::MAX_CONTROL_PAYLOAD;
use crate::channel::ByteWriter;
use crate::error::{Error, Result};
use crate::frame::{Frame, FrameType};
use crate::mask::{apply_mask_offset, generate_mask};

/// Masked payloads are copied through a scratch buffer this many bytes at a time
const MASK_CHUNK: usize = 16 * 1024;

/// Writes frames into a byte channel
///
/// `&mut self` on every write keeps frames in submission order.
pub struct FrameWriter {
    sink: ByteWriter,
    role: Role,
    /// Type of the fragmented message currently open
    fragmenting: Option<FrameType>,
    header_buf: BytesMut,
    scratch: BytesMut,
}

impl FrameWriter {
    /// Create a writer for an endpoint with the given role
    pub fn new(sink: ByteWriter, role: Role) -> Self {
        Self {
            sink,
            role,
            fragmenting: None,
            header_buf: BytesMut::with_capacity(crate::MAX_FRAME_HEADER_SIZE),
            scratch: BytesMut::new(),
        }
    }

    /// Write one frame
    ///
    /// The frame's release hook runs once the whole frame is in the channel.
    /// On error the hook runs when the frame is dropped.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<()> {
        let frame_type = frame.frame_type();

        let opcode = if frame_type.is_control() {
            if frame.len() > MAX_CONTROL_PAYLOAD {
                return Err(Error::ProtocolViolation("control frame payload exceeds 125 bytes"));
            }
            OpCode::Frame(frame_type)
        } else {
            match self.fragmenting {
                Some(open) if open == frame_type => OpCode::Continuation,
                Some(_) => {
                    return Err(Error::ProtocolViolation(
                        "data frame of another type while a fragmented message is open",
                    ));
                }
                None => OpCode::Frame(frame_type),
            }
        };

        let (rsv1, rsv2, rsv3) = frame.rsv();
        let header = FrameHeader {
            fin: frame.fin(),
            rsv1,
            rsv2,
            rsv3,
            opcode,
            payload_len: frame.len() as u64,
            mask: self.role.masks_output().then(generate_mask),
        };

        self.header_buf.clear();
        header.encode(&mut self.header_buf);
        self.sink.write(&self.header_buf).await?;

        match header.mask {
            Some(mask) => self.write_masked(frame.payload(), mask).await?,
            None => self.sink.write(frame.payload()).await?,
        }

        if !frame_type.is_control() {
            self.fragmenting = if frame.fin() { None } else { Some(frame_type) };
        }

        frame.release();
        Ok(())
    }

    async fn write_masked(&mut self, payload: &[u8], mask: [u8; 4]) -> Result<()> {
        for (i, chunk) in payload.chunks(MASK_CHUNK).enumerate() {
            self.scratch.clear();
            self.scratch.extend_from_slice(chunk);
            apply_mask_offset(&mut self.scratch, mask, i * MASK_CHUNK);
            self.sink.write(&self.scratch).await?;
        }
        Ok(())
    }

    /// Split a message into fragments of at most `fragment_size` bytes
    ///
    /// Control frame types are rejected: they cannot be fragmented.
    pub async fn write_fragmented(
        &mut self,
        frame_type: FrameType,
        data: impl Into<Bytes>,
        fragment_size: usize,
    ) -> Result<()> {
        if frame_type.is_control() {
            return Err(Error::ProtocolViolation("control frame must not be fragmented"));
        }
        let data = data.into();
        let fragment_size = fragment_size.max(1);

        if data.is_empty() {
            return self
                .write_frame(Frame::by_type(true, frame_type, data, false, false, false)?)
                .await;
        }

        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + fragment_size).min(data.len());
            let fin = end == data.len();
            let frame = Frame::by_type(fin, frame_type, data.slice(offset..end), false, false, false)?;
            self.write_frame(frame).await?;
            offset = end;
        }
        Ok(())
    }

    /// Written bytes are visible to the channel reader as soon as they are
    /// written; this only reports a closed channel
    pub async fn flush(&mut self) -> Result<()> {
        match self.sink.state().cause() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Close the channel cleanly; the reader sees end of stream after the
    /// frames already written
    pub fn close(&mut self) {
        self.sink.close(None);
    }

    /// Whether a fragmented message is open
    pub fn is_fragmenting(&self) -> bool {
        self.fragmenting.is_some()
    }

    /// Get a reference to the underlying channel
    pub fn get_ref(&self) -> &ByteWriter {
        &self.sink
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("role", &self.role)
            .field("fragmenting", &self.fragmenting)
            .finish()
    }
}
