//! UTF-8 validation for text payloads
//!
//! Whole payloads are checked with `simdutf8`. Fragmented text needs
//! streaming validation: a code point may be split across a fragment
//! boundary, and that must never be reported as an error.

use crate::error::{Error, Result};

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Check if data is valid UTF-8 up to an incomplete sequence at the end
///
/// Returns:
/// - `(true, n)` if all complete sequences are valid, where `n` is the number
///   of trailing bytes that start a code point the data does not finish (0-3)
/// - `(false, 0)` if there's an invalid UTF-8 sequence
pub fn validate_utf8_incomplete(data: &[u8]) -> (bool, usize) {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => (true, 0),
        // error_len() is None only when the input ends inside a code point
        Err(e) if e.error_len().is_none() => (true, data.len() - e.valid_up_to()),
        Err(_) => (false, 0),
    }
}

/// Number of bytes in the sequence started by `lead`, or `None` if `lead`
/// cannot start a sequence
#[inline]
fn sequence_len(lead: u8) -> Option<usize> {
    match lead {
        0x00..=0x7F => Some(1),
        0xC2..=0xDF => Some(2),
        0xE0..=0xEF => Some(3),
        0xF0..=0xF4 => Some(4),
        _ => None,
    }
}

/// Incremental decoder for text delivered in fragments
///
/// Bytes of a code point split across fragments are carried over to the next
/// [`push`](Utf8Decoder::push).
///
/// ```
/// use sockudo_wire::utf8::Utf8Decoder;
///
/// let mut decoder = Utf8Decoder::new();
/// let mut text = String::new();
/// let euro = "€".as_bytes();
///
/// decoder.push(&euro[..1], &mut text).unwrap();
/// decoder.push(&euro[1..], &mut text).unwrap();
/// decoder.finish().unwrap();
/// assert_eq!(text, "€");
/// ```
#[derive(Debug, Default, Clone)]
pub struct Utf8Decoder {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Decoder {
    /// Create a decoder with no carried bytes
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes carried over from the previous fragment
    #[inline]
    pub fn pending(&self) -> usize {
        self.pending_len
    }

    /// Decode a fragment, appending every complete character to `out`
    pub fn push(&mut self, fragment: &[u8], out: &mut String) -> Result<()> {
        let mut rest = fragment;

        if self.pending_len > 0 {
            let need = sequence_len(self.pending[0]).ok_or(Error::InvalidUtf8)? - self.pending_len;
            let take = need.min(rest.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&rest[..take]);
            self.pending_len += take;
            rest = &rest[take..];

            if take < need {
                // still incomplete, but what we have must be a valid prefix
                let (valid, _) = validate_utf8_incomplete(&self.pending[..self.pending_len]);
                return if valid { Ok(()) } else { Err(Error::InvalidUtf8) };
            }

            let ch = simdutf8::basic::from_utf8(&self.pending[..self.pending_len])
                .map_err(|_| Error::InvalidUtf8)?;
            out.push_str(ch);
            self.pending_len = 0;
        }

        match simdutf8::compat::from_utf8(rest) {
            Ok(s) => out.push_str(s),
            Err(e) if e.error_len().is_none() => {
                let (valid, tail) = rest.split_at(e.valid_up_to());
                // valid_up_to marks a verified prefix
                out.push_str(simdutf8::basic::from_utf8(valid).map_err(|_| Error::InvalidUtf8)?);
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
            }
            Err(_) => return Err(Error::InvalidUtf8),
        }
        Ok(())
    }

    /// End of message: fails if a code point was left unfinished
    pub fn finish(&mut self) -> Result<()> {
        if self.pending_len == 0 {
            Ok(())
        } else {
            self.pending_len = 0;
            Err(Error::InvalidUtf8)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_valid_utf8() {
        assert!(validate_utf8(b"Hello, World!"));
        assert!(validate_utf8("Привет мир".as_bytes()));
        assert!(validate_utf8("🎉🚀".as_bytes()));
        assert!(validate_utf8(b""));
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(!validate_utf8(&[0xff, 0xfe]));
        // overlong
        assert!(!validate_utf8(&[0xc0, 0x80]));
        // surrogate
        assert!(!validate_utf8(&[0xed, 0xa0, 0x80]));
    }

    #[test]
    fn test_incomplete_sequences() {
        assert_eq!(validate_utf8_incomplete(b"abc"), (true, 0));
        assert_eq!(validate_utf8_incomplete(&[b'a', 0xe2, 0x82]), (true, 2));
        assert_eq!(validate_utf8_incomplete(&[0xf0, 0x9f]), (true, 2));
        assert_eq!(validate_utf8_incomplete(&[0xff, b'a']), (false, 0));
        // invalid lead of an incomplete tail
        assert_eq!(validate_utf8_incomplete(&[b'a', 0xed, 0xa0]), (false, 0));
    }

    #[test]
    fn test_decoder_rejects_bad_continuation() {
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        decoder.push(&[0xe2], &mut out).unwrap();
        assert!(decoder.push(&[b'a'], &mut out).is_err());
    }

    #[test]
    fn test_decoder_finish_with_pending_bytes() {
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        decoder.push(b"ok\xf0\x9f", &mut out).unwrap();
        assert_eq!(out, "ok");
        assert_eq!(decoder.pending(), 2);
        assert!(matches!(decoder.finish(), Err(Error::InvalidUtf8)));
    }

    #[test]
    fn test_decoder_one_byte_at_a_time() {
        let text = "a€𝄞ß";
        let mut decoder = Utf8Decoder::new();
        let mut out = String::new();
        for b in text.as_bytes() {
            decoder.push(std::slice::from_ref(b), &mut out).unwrap();
        }
        decoder.finish().unwrap();
        assert_eq!(out, text);
    }

    proptest! {
        #[test]
        fn decoder_splits_anywhere(text in "\\PC{0,40}", cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..4)) {
            let bytes = text.as_bytes();
            let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(bytes.len() + 1)).collect();
            offsets.push(0);
            offsets.push(bytes.len());
            offsets.sort_unstable();

            let mut decoder = Utf8Decoder::new();
            let mut out = String::new();
            for pair in offsets.windows(2) {
                decoder.push(&bytes[pair[0]..pair[1]], &mut out).unwrap();
            }
            decoder.finish().unwrap();
            prop_assert_eq!(out, text);
        }
    }
}
