//! RFC 6455 frame header encoding and the incremental frame parser

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::frame::FrameType;
use crate::mask::apply_mask;
use crate::{MAX_CONTROL_PAYLOAD, MEDIUM_MESSAGE_THRESHOLD, RSV1, RSV2, RSV3, SMALL_MESSAGE_THRESHOLD};

/// Wire opcode, including continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation of a fragmented message
    Continuation,
    /// Any frame type
    Frame(FrameType),
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            other => FrameType::from_opcode(other).map(OpCode::Frame),
        }
    }

    /// Wire value
    #[inline]
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Frame(ft) => ft.opcode(),
        }
    }

    /// Check if this is a control opcode
    #[inline]
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Frame(ft) if ft.is_control())
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1
    pub rsv1: bool,
    /// RSV2
    pub rsv2: bool,
    /// RSV3
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let len = if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            8
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            2
        } else {
            0
        };
        2 + len + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.header_size());

        let mut b0 = self.opcode.as_u8();
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= RSV1;
        }
        if self.rsv2 {
            b0 |= RSV2;
        }
        if self.rsv3 {
            b0 |= RSV3;
        }
        buf.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// Incremental frame parser over a receive buffer
///
/// Header bytes stay in the buffer until the whole header has arrived, so a
/// header split across reads is simply parsed again on the next call. Once
/// the header is consumed the parser waits for the full payload.
#[derive(Debug)]
pub struct FrameParser {
    /// Header consumed, payload pending
    header: Option<FrameHeader>,
    /// Maximum frame size
    max_frame_size: usize,
    /// Whether to expect masked frames (server mode)
    expect_masked: bool,
    /// RSV bits negotiated by an extension
    reserved_bits: u8,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            header: None,
            max_frame_size,
            expect_masked,
            reserved_bits: 0,
        }
    }

    /// Allow the given RSV bits (a mask over `RSV1 | RSV2 | RSV3`)
    pub fn with_reserved_bits(mut self, mask: u8) -> Self {
        self.reserved_bits = mask;
        self
    }

    /// Whether the parser holds part of a frame
    #[inline]
    pub fn is_mid_frame(&self, buf: &BytesMut) -> bool {
        self.header.is_some() || !buf.is_empty()
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - `Ok(Some((header, payload)))` with the payload already unmasked
    /// - `Ok(None)` if more data is needed
    /// - `Err(e)` if the bytes violate the protocol
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<(FrameHeader, BytesMut)>> {
        if self.header.is_none() {
            match self.decode_header(buf)? {
                Some((header, size)) => {
                    buf.advance(size);
                    self.header = Some(header);
                }
                None => return Ok(None),
            }
        }

        let payload_len = match &self.header {
            Some(header) => header.payload_len as usize,
            None => return Ok(None),
        };
        if buf.len() < payload_len {
            buf.reserve(payload_len - buf.len());
            return Ok(None);
        }

        let mut payload = buf.split_to(payload_len);
        let header = self.header.take();
        match header {
            Some(header) => {
                if let Some(mask) = header.mask {
                    apply_mask(&mut payload, mask);
                }
                Ok(Some((header, payload)))
            }
            None => Ok(None),
        }
    }

    /// Decode a header from the front of `buf` without consuming it
    ///
    /// Fields are validated as soon as the bytes carrying them are present.
    fn decode_header(&self, buf: &[u8]) -> Result<Option<(FrameHeader, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let b0 = buf[0];
        let b1 = buf[1];

        let fin = b0 & 0x80 != 0;
        let rsv = b0 & (RSV1 | RSV2 | RSV3);
        if rsv & !self.reserved_bits != 0 {
            return Err(Error::ProtocolViolation("reserved bits set without a negotiated extension"));
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::InvalidOpcode(b0 & 0x0F))?;
        if opcode.is_control() && !fin {
            return Err(Error::ProtocolViolation("control frame must not be fragmented"));
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(Error::ProtocolViolation("client frames must be masked"));
        }
        if !self.expect_masked && masked {
            return Err(Error::ProtocolViolation("server frames must not be masked"));
        }

        let (payload_len, len_end) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::ProtocolViolation("payload length not minimal"));
                }
                (len, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(Error::ProtocolViolation("payload length MSB must be 0"));
                }
                if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                    return Err(Error::ProtocolViolation("payload length not minimal"));
                }
                (len, 10)
            }
            len => (len as u64, 2),
        };

        if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(Error::ProtocolViolation("control frame payload exceeds 125 bytes"));
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }

        let header_size = len_end + if masked { 4 } else { 0 };
        if buf.len() < header_size {
            return Ok(None);
        }
        let mask = masked.then(|| [buf[len_end], buf[len_end + 1], buf[len_end + 2], buf[len_end + 3]]);

        Ok(Some((
            FrameHeader {
                fin,
                rsv1: rsv & RSV1 != 0,
                rsv2: rsv & RSV2 != 0,
                rsv3: rsv & RSV3 != 0,
                opcode,
                payload_len,
                mask,
            },
            header_size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(opcode: OpCode, payload_len: u64, mask: Option<[u8; 4]>) -> FrameHeader {
        FrameHeader {
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            payload_len,
            mask,
        }
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Frame(FrameType::Ping).is_control());
        assert!(!OpCode::Frame(FrameType::Text).is_control());
        assert!(!OpCode::Continuation.is_control());
        assert_eq!(OpCode::from_u8(0x0), Some(OpCode::Continuation));
        assert_eq!(OpCode::from_u8(0xB), None);
        assert_eq!(OpCode::Frame(FrameType::Pong).as_u8(), 0xA);
    }

    #[test]
    fn test_length_thresholds() {
        for (len, size, marker) in [
            (0u64, 2, 0u8),
            (125, 2, 125),
            (126, 4, 126),
            (65535, 4, 126),
            (65536, 10, 127),
        ] {
            let h = header(OpCode::Frame(FrameType::Binary), len, None);
            let mut buf = BytesMut::new();
            h.encode(&mut buf);
            assert_eq!(buf.len(), size, "len {len}");
            assert_eq!(h.header_size(), size);
            assert_eq!(buf[1] & 0x7F, marker);
        }
    }

    #[test]
    fn test_parse_small_unmasked() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let (header, payload) = parser.parse(&mut buf).unwrap().unwrap();
        assert!(header.fin);
        assert_eq!(header.opcode, OpCode::Frame(FrameType::Text));
        assert_eq!(&payload[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_small_masked() {
        let mut parser = FrameParser::new(1024 * 1024, true);
        let mask = [0x37, 0xfa, 0x21, 0x3d];
        let mut buf = BytesMut::from(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58][..]);

        let (header, payload) = parser.parse(&mut buf).unwrap().unwrap();
        assert_eq!(header.mask, Some(mask));
        assert_eq!(&payload[..], b"Hello");
    }

    #[test]
    fn test_parse_byte_by_byte() {
        let mut encoded = BytesMut::new();
        header(OpCode::Frame(FrameType::Binary), 300, Some([1, 2, 3, 4])).encode(&mut encoded);
        let mut payload = vec![7u8; 300];
        apply_mask(&mut payload, [1, 2, 3, 4]);
        encoded.extend_from_slice(&payload);

        let mut parser = FrameParser::new(1024 * 1024, true);
        let mut buf = BytesMut::new();
        let mut result = None;
        for (i, b) in encoded.iter().enumerate() {
            buf.put_u8(*b);
            if let Some(frame) = parser.parse(&mut buf).unwrap() {
                assert_eq!(i, encoded.len() - 1);
                result = Some(frame);
            }
        }
        let (header, payload) = result.unwrap();
        assert_eq!(header.payload_len, 300);
        assert!(payload.iter().all(|&b| b == 7));
    }

    #[test]
    fn test_control_frame_fragmentation() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x09, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_control_frame_too_large() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x89, 126, 0x00, 0x7e][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_rejects_non_minimal_lengths() {
        let mut parser = FrameParser::new(1 << 20, false);
        let mut buf = BytesMut::from(&[0x82, 126, 0x00, 0x05][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::ProtocolViolation(_))));

        let mut parser = FrameParser::new(1 << 20, false);
        let mut buf = BytesMut::from(&[0x82, 127, 0, 0, 0, 0, 0, 0, 0xff, 0xff][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_rejects_length_msb() {
        let mut parser = FrameParser::new(usize::MAX, false);
        let mut buf = BytesMut::from(&[0x82, 127, 0x80, 0, 0, 0, 0, 0, 0, 0][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(100, false);
        let mut buf = BytesMut::from(&[0x82, 126, 0x01, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::FrameTooLarge)));
    }

    #[test]
    fn test_masking_by_role() {
        let mut server = FrameParser::new(1024, true);
        let mut buf = BytesMut::from(&[0x81, 0x00][..]);
        assert!(matches!(server.parse(&mut buf), Err(Error::ProtocolViolation(_))));

        let mut client = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x81, 0x80, 0, 0, 0, 0][..]);
        assert!(matches!(client.parse(&mut buf), Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn test_reserved_bits() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::ProtocolViolation(_))));

        let mut parser = FrameParser::new(1024, false).with_reserved_bits(RSV1);
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]);
        let (header, _) = parser.parse(&mut buf).unwrap().unwrap();
        assert!(header.rsv1);
        assert!(!header.rsv2);
    }

    #[test]
    fn test_invalid_opcode() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x83, 0x00][..]);
        assert!(matches!(parser.parse(&mut buf), Err(Error::InvalidOpcode(0x3))));
    }
}
