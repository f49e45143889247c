//! Opening handshake keys
//!
//! Only the key exchange of the HTTP upgrade lives here; requests and
//! responses are built and parsed by the HTTP layer.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::{Error, Result};
use crate::mask::generate_mask;

/// Generate a random Sec-WebSocket-Key (client-side)
pub fn generate_key() -> String {
    let mut bytes = [0u8; 16];
    for chunk in bytes.chunks_exact_mut(4) {
        chunk.copy_from_slice(&generate_mask());
    }
    STANDARD.encode(bytes)
}

/// Check that a Sec-WebSocket-Key is the Base64 encoding of 16 bytes
/// (server-side)
pub fn validate_key(key: &str) -> Result<()> {
    match STANDARD.decode(key.trim()) {
        Ok(raw) if raw.len() == 16 => Ok(()),
        Ok(_) => Err(Error::HandshakeFailed("Sec-WebSocket-Key must encode 16 bytes")),
        Err(_) => Err(Error::HandshakeFailed("Sec-WebSocket-Key is not valid Base64")),
    }
}

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Validate the server's accept key (client-side)
pub fn validate_accept_key(sent_key: &str, received_accept: &str) -> Result<()> {
    if generate_accept_key(sent_key) == received_accept.trim() {
        Ok(())
    } else {
        tracing::debug!(received_accept, "Sec-WebSocket-Accept mismatch");
        Err(Error::HandshakeFailed("Sec-WebSocket-Accept does not match the key"))
    }
}
