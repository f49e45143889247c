//! WebSocket frame masking utilities
//!
//! Masking XORs every payload byte with the 4-byte key cycled by index % 4.
//! The operation is its own inverse, so the same function masks and unmasks.
//!
//! Supports two RNG backends for client keys via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: cryptographically secure RNG (takes priority when enabled)

/// Apply the mask in place
///
/// Processes 8 bytes per step by XORing with the key repeated twice.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    let word = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(bytes) ^ word;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    // the remainder starts at a multiple of 8, so the key phase is 0
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply the mask to a slice that starts `offset` bytes into the payload
///
/// Used when a payload is masked in several pieces.
#[inline]
pub fn apply_mask_offset(data: &mut [u8], mask: [u8; 4], offset: usize) {
    let offset = offset & 3;
    if offset == 0 {
        apply_mask(data, mask);
        return;
    }

    let rotated = [
        mask[offset],
        mask[(offset + 1) & 3],
        mask[(offset + 2) & 3],
        mask[(offset + 3) & 3],
    ];
    apply_mask(data, rotated);
}

/// Generate a random mask for client frames
#[inline]
pub fn generate_mask() -> [u8; 4] {
    generate_mask_inner()
}

#[cfg(feature = "getrandom")]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    let mut buf = [0u8; 4];
    match getrandom::getrandom(&mut buf) {
        Ok(()) => buf,
        Err(e) => {
            tracing::warn!(error = %e, "getrandom failed, falling back to clock-seeded mask");
            clock_seeded_mask()
        }
    }
}

#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
#[inline]
fn generate_mask_inner() -> [u8; 4] {
    fastrand::u32(..).to_ne_bytes()
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
fn generate_mask_inner() -> [u8; 4] {
    compile_error!("At least one RNG feature must be enabled: fastrand or getrandom");
}

#[cfg(feature = "getrandom")]
fn clock_seeded_mask() -> [u8; 4] {
    let mut seed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;

    // xorshift64
    seed ^= seed << 13;
    seed ^= seed >> 7;
    seed ^= seed << 17;

    (seed as u32).to_ne_bytes()
}
