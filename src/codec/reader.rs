//! Frame reader: byte channel to frames

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::future::poll_fn;

use super::Role;
use super::header::{FrameHeader, FrameParser, OpCode};
use crate::channel::ByteReader;
use crate::error::{CloseReason, Error, Result};
use crate::frame::{Frame, FrameType};
use crate::utf8::{validate_utf8, validate_utf8_incomplete};
use crate::{Config, FragmentMode};

/// Bytes pulled from the channel per read
const READ_CHUNK: usize = 8 * 1024;

/// Message being reassembled from fragments
struct Assembly {
    frame_type: FrameType,
    rsv: (bool, bool, bool),
    buf: BytesMut,
    /// Prefix of `buf` already checked as UTF-8
    checked: usize,
}

impl Assembly {
    /// Validate text appended since the last check
    ///
    /// A code point cut at the end of the buffer is left for the next
    /// fragment.
    fn check_text(&mut self) -> Result<()> {
        if self.frame_type != FrameType::Text {
            return Ok(());
        }
        let (valid, incomplete) = validate_utf8_incomplete(&self.buf[self.checked..]);
        if !valid {
            return Err(Error::InvalidUtf8);
        }
        self.checked = self.buf.len() - incomplete;
        Ok(())
    }
}

/// Reads frames from a byte channel
///
/// Fatal errors cancel the channel with the same cause and are sticky:
/// every later call returns the error again.
pub struct FrameReader {
    source: ByteReader,
    parser: FrameParser,
    read_buf: BytesMut,
    mode: FragmentMode,
    max_message_size: usize,
    /// Assembled mode: message in progress
    assembly: Option<Assembly>,
    /// Raw mode: type of the open fragmented message
    open_fragment: Option<FrameType>,
    failed: Option<Error>,
    finished: bool,
    error_reported: bool,
}

impl FrameReader {
    /// Create a reader for an endpoint with the given role
    pub fn new(source: ByteReader, role: Role, config: &Config) -> Self {
        Self {
            source,
            parser: FrameParser::new(config.max_frame_size, role.expects_masked_input())
                .with_reserved_bits(config.reserved_bits),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            mode: config.fragment_mode,
            max_message_size: config.max_message_size,
            assembly: None,
            open_fragment: None,
            failed: None,
            finished: false,
            error_reported: false,
        }
    }

    /// Read the next frame
    ///
    /// `Ok(None)` marks the end of the frame stream: after a Close frame, or
    /// when the channel ends at a frame boundary.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        poll_fn(|cx| self.poll_next_frame(cx)).await
    }

    /// Poll for the next frame
    pub fn poll_next_frame(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Frame>>> {
        if let Some(err) = &self.failed {
            return Poll::Ready(Err(err.clone()));
        }
        if self.finished {
            return Poll::Ready(Ok(None));
        }

        loop {
            match self.parser.parse(&mut self.read_buf) {
                Ok(Some((header, payload))) => match self.on_frame(header, payload.freeze()) {
                    Ok(Some(frame)) => return Poll::Ready(Ok(Some(frame))),
                    Ok(None) => continue,
                    Err(e) => return Poll::Ready(Err(self.fail(e))),
                },
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(self.fail(e))),
            }

            match ready!(self.source.poll_read_buf(cx, &mut self.read_buf, READ_CHUNK)) {
                Ok(0) => {
                    if self.parser.is_mid_frame(&self.read_buf)
                        || self.assembly.is_some()
                        || self.open_fragment.is_some()
                    {
                        return Poll::Ready(Err(self.fail(Error::TruncatedStream)));
                    }
                    self.finished = true;
                    return Poll::Ready(Ok(None));
                }
                Ok(_) => continue,
                Err(e) => {
                    // the channel already carries this cause
                    self.failed = Some(e.clone());
                    return Poll::Ready(Err(e));
                }
            }
        }
    }

    /// Whether the frame stream has ended cleanly
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Get a reference to the underlying channel
    pub fn get_ref(&self) -> &ByteReader {
        &self.source
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::debug!(error = %err, "frame stream failed");
        self.source.cancel(err.clone());
        self.failed = Some(err.clone());
        err
    }

    fn on_frame(&mut self, header: FrameHeader, payload: Bytes) -> Result<Option<Frame>> {
        let rsv = (header.rsv1, header.rsv2, header.rsv3);

        let frame_type = match header.opcode {
            OpCode::Continuation => return self.on_continuation(header.fin, rsv, payload),
            OpCode::Frame(ft) => ft,
        };

        if frame_type.is_control() {
            if frame_type == FrameType::Close {
                if payload.len() >= 2 {
                    let code = u16::from_be_bytes([payload[0], payload[1]]);
                    if !CloseReason::is_valid_code(code) {
                        return Err(Error::ProtocolViolation("invalid close code"));
                    }
                }
                self.finished = true;
            }
            return Frame::by_type(true, frame_type, payload, rsv.0, rsv.1, rsv.2).map(Some);
        }

        if self.assembly.is_some() || self.open_fragment.is_some() {
            return Err(Error::ProtocolViolation("expected continuation frame"));
        }

        if header.fin {
            if frame_type == FrameType::Text && !validate_utf8(&payload) {
                return Err(Error::InvalidUtf8);
            }
            return Frame::by_type(true, frame_type, payload, rsv.0, rsv.1, rsv.2).map(Some);
        }

        match self.mode {
            FragmentMode::Raw => {
                self.open_fragment = Some(frame_type);
                Frame::by_type(false, frame_type, payload, rsv.0, rsv.1, rsv.2).map(Some)
            }
            FragmentMode::Assembled => {
                if payload.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                let mut assembly = Assembly {
                    frame_type,
                    rsv,
                    buf: BytesMut::with_capacity(payload.len() * 2),
                    checked: 0,
                };
                assembly.buf.extend_from_slice(&payload);
                assembly.check_text()?;
                self.assembly = Some(assembly);
                Ok(None)
            }
        }
    }

    fn on_continuation(
        &mut self,
        fin: bool,
        rsv: (bool, bool, bool),
        payload: Bytes,
    ) -> Result<Option<Frame>> {
        match self.mode {
            FragmentMode::Raw => {
                let frame_type = self
                    .open_fragment
                    .ok_or(Error::ProtocolViolation("unexpected continuation frame"))?;
                if fin {
                    self.open_fragment = None;
                }
                Frame::by_type(fin, frame_type, payload, rsv.0, rsv.1, rsv.2).map(Some)
            }
            FragmentMode::Assembled => {
                let assembly = self
                    .assembly
                    .as_mut()
                    .ok_or(Error::ProtocolViolation("unexpected continuation frame"))?;

                if assembly.buf.len() + payload.len() > self.max_message_size {
                    return Err(Error::MessageTooLarge);
                }
                assembly.buf.extend_from_slice(&payload);
                assembly.check_text()?;

                if !fin {
                    return Ok(None);
                }

                let Some(assembly) = self.assembly.take() else {
                    return Ok(None);
                };
                if assembly.checked != assembly.buf.len() {
                    // message ended inside a code point
                    return Err(Error::InvalidUtf8);
                }
                let (rsv1, rsv2, rsv3) = assembly.rsv;
                Frame::by_type(true, assembly.frame_type, assembly.buf.freeze(), rsv1, rsv2, rsv3)
                    .map(Some)
            }
        }
    }
}

impl Stream for FrameReader {
    type Item = Result<Frame>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.error_reported {
            return Poll::Ready(None);
        }
        match ready!(this.poll_next_frame(cx)) {
            Ok(Some(frame)) => Poll::Ready(Some(Ok(frame))),
            Ok(None) => Poll::Ready(None),
            Err(e) => {
                this.error_reported = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}

impl std::fmt::Debug for FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("mode", &self.mode)
            .field("buffered", &self.read_buf.len())
            .field("assembling", &self.assembly.is_some())
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelState, channel};
    use crate::mask::apply_mask;
    use futures_util::{FutureExt, StreamExt};
    use proptest::prelude::*;

    /// Reader over a channel that holds `bytes` and is then closed
    fn reader_for(bytes: &[u8], role: Role, config: &Config) -> FrameReader {
        let (mut tx, rx) = channel(bytes.len().max(1));
        tx.write(bytes)
            .now_or_never()
            .expect("window fits the bytes")
            .unwrap();
        drop(tx);
        FrameReader::new(rx, role, config)
    }

    fn raw_config() -> Config {
        Config::builder().fragment_mode(FragmentMode::Raw).build()
    }

    #[tokio::test]
    async fn test_reads_hello() {
        let config = Config::default();
        let mut reader = reader_for(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o'], Role::Client, &config);

        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.frame_type(), FrameType::Text);
        assert!(frame.fin());
        assert_eq!(frame.as_text().unwrap(), "Hello");
        assert!(reader.next_frame().await.unwrap().is_none());
        assert!(reader.is_finished());
    }

    #[tokio::test]
    async fn test_server_unmasks() {
        let config = Config::default();
        let mask = [0x11, 0x22, 0x33, 0x44];
        let mut payload = *b"masked";
        apply_mask(&mut payload, mask);
        let mut bytes = vec![0x82, 0x86];
        bytes.extend_from_slice(&mask);
        bytes.extend_from_slice(&payload);

        let mut reader = reader_for(&bytes, Role::Server, &config);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(&frame.payload()[..], b"masked");
    }

    #[tokio::test]
    async fn test_assembles_fragments() {
        let config = Config::default();
        let bytes = [
            0x01, 0x03, b'H', b'e', b'l', // text, fin=0
            0x89, 0x01, b'p', // ping in between
            0x00, 0x02, b'l', b'o', // continuation, fin=0
            0x80, 0x01, b'!', // continuation, fin=1
        ];
        let mut reader = reader_for(&bytes, Role::Client, &config);

        let ping = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(ping.frame_type(), FrameType::Ping);

        let text = reader.next_frame().await.unwrap().unwrap();
        assert!(text.fin());
        assert_eq!(text.as_text().unwrap(), "Hello!");
    }

    #[tokio::test]
    async fn test_raw_mode_delivers_fragments() {
        let config = raw_config();
        let bytes = [0x02, 0x01, 1, 0x00, 0x01, 2, 0x80, 0x01, 3];
        let mut reader = reader_for(&bytes, Role::Client, &config);

        let mut seen = Vec::new();
        while let Some(frame) = reader.next_frame().await.unwrap() {
            assert_eq!(frame.frame_type(), FrameType::Binary);
            seen.push((frame.fin(), frame.payload()[0]));
        }
        assert_eq!(seen, vec![(false, 1), (false, 2), (true, 3)]);
    }

    #[tokio::test]
    async fn test_split_code_point_across_fragments() {
        let config = Config::default();
        // "€" is e2 82 ac
        let bytes = [0x01, 0x02, b'a', 0xe2, 0x80, 0x02, 0x82, 0xac];
        let mut reader = reader_for(&bytes, Role::Client, &config);
        let frame = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(frame.as_text().unwrap(), "a€");
    }

    #[tokio::test]
    async fn test_message_ending_inside_code_point() {
        let config = Config::default();
        let bytes = [0x01, 0x01, b'a', 0x80, 0x01, 0xe2];
        let mut reader = reader_for(&bytes, Role::Client, &config);
        assert!(matches!(reader.next_frame().await, Err(Error::InvalidUtf8)));
    }

    #[tokio::test]
    async fn test_unexpected_continuation() {
        let config = Config::default();
        let mut reader = reader_for(&[0x80, 0x00], Role::Client, &config);
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_data_frame_inside_open_message() {
        let config = Config::default();
        let mut reader = reader_for(&[0x01, 0x01, b'a', 0x81, 0x01, b'b'], Role::Client, &config);
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let config = Config::builder().max_message_size(4).build();
        let bytes = [0x02, 0x03, 1, 2, 3, 0x80, 0x03, 4, 5, 6];
        let mut reader = reader_for(&bytes, Role::Client, &config);
        assert!(matches!(reader.next_frame().await, Err(Error::MessageTooLarge)));
    }

    #[tokio::test]
    async fn test_errors_are_sticky_and_cancel_channel() {
        let config = Config::default();
        let (mut tx, rx) = channel(64);
        tx.write(&[0x09, 0x00]).await.unwrap();
        let mut reader = FrameReader::new(rx, Role::Client, &config);

        let first = reader.next_frame().await.unwrap_err();
        let second = reader.next_frame().await.unwrap_err();
        assert!(matches!(first, Error::ProtocolViolation(_)));
        assert_eq!(first.to_string(), second.to_string());
        assert!(matches!(
            reader.get_ref().state(),
            ChannelState::Closed(Some(Error::ProtocolViolation(_)))
        ));
        assert!(matches!(
            tx.write(b"more").await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream() {
        let config = Config::default();
        let mut reader = reader_for(&[0x82, 0x05, 1, 2], Role::Client, &config);
        assert!(matches!(reader.next_frame().await, Err(Error::TruncatedStream)));

        let mut reader = reader_for(&[0x02, 0x01, 1], Role::Client, &config);
        assert!(matches!(reader.next_frame().await, Err(Error::TruncatedStream)));
    }

    #[tokio::test]
    async fn test_close_ends_stream() {
        let config = Config::default();
        let bytes = [0x88, 0x02, 0x03, 0xe8, 0x81, 0x01, b'x'];
        let mut reader = reader_for(&bytes, Role::Client, &config);

        let close = reader.next_frame().await.unwrap().unwrap();
        assert_eq!(close.close_reason(), Some(CloseReason::new(1000, "")));
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalid_close_code() {
        let config = Config::default();
        let mut reader = reader_for(&[0x88, 0x02, 0x03, 0xed], Role::Client, &config);
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_stream_impl_ends_after_error() {
        let config = Config::default();
        let mut reader = reader_for(&[0x81, 0x01, b'a', 0x83, 0x00], Role::Client, &config);

        assert!(reader.next().await.unwrap().is_ok());
        assert!(matches!(
            reader.next().await,
            Some(Err(Error::InvalidOpcode(3)))
        ));
        assert!(reader.next().await.is_none());
    }

    proptest! {
        #[test]
        fn fragmented_text_reassembles(
            text in "\\PC{1,30}",
            cuts in proptest::collection::vec(any::<prop::sample::Index>(), 1..5),
        ) {
            let bytes = text.as_bytes();
            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            offsets.push(0);
            offsets.push(bytes.len());
            offsets.sort_unstable();
            offsets.dedup();

            let pieces: Vec<&[u8]> = offsets.windows(2).map(|w| &bytes[w[0]..w[1]]).collect();
            let mut wire = Vec::new();
            for (i, piece) in pieces.iter().enumerate() {
                let opcode = if i == 0 { 0x1 } else { 0x0 };
                let fin = if i == pieces.len() - 1 { 0x80 } else { 0x00 };
                wire.push(fin | opcode);
                wire.push(piece.len() as u8);
                wire.extend_from_slice(piece);
            }

            let config = Config::default();
            let mut reader = reader_for(&wire, Role::Client, &config);
            let frame = tokio_test::block_on(reader.next_frame()).unwrap().unwrap();
            prop_assert_eq!(frame.as_text().unwrap(), text.as_str());
        }
    }
}
