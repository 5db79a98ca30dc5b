//! WebSocket frame masking utilities
//!
//! Masking is an anti-cache-poisoning measure, not confidentiality, so the
//! key only has to be unpredictable to intermediaries. Two RNG backends:
//! - `fastrand` (default): thread-local PRNG seeded from process entropy
//! - `getrandom` feature: OS RNG, falling back to `fastrand` on failure

/// Generate a random mask for WebSocket client frames
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    fill_random(&mut key);
    key
}

/// Generate the 16 random bytes behind a `Sec-WebSocket-Key`
pub fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    fill_random(&mut nonce);
    nonce
}

#[cfg(feature = "getrandom")]
fn fill_random(buf: &mut [u8]) {
    if getrandom::getrandom(buf).is_err() {
        fastrand::fill(buf);
    }
}

#[cfg(not(feature = "getrandom"))]
#[inline]
fn fill_random(buf: &mut [u8]) {
    fastrand::fill(buf);
}

/// Apply a WebSocket mask in place.
///
/// `data[i] ^= mask[i % 4]`. The operation is its own inverse, so the same
/// call masks outgoing and unmasks incoming payloads.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    if data.is_empty() {
        return;
    }

    // 8 bytes at a time; every chunk starts at a multiple of 4 so the key lines up
    let wide = u64::from_ne_bytes([
        mask[0], mask[1], mask[2], mask[3], mask[0], mask[1], mask[2], mask[3],
    ]);
    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        chunk.copy_from_slice(&(u64::from_ne_bytes(word) ^ wide).to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Apply mask when `data` starts `offset` bytes into the masked payload
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

/// Return a masked copy of `data`, leaving the input untouched
pub fn mask_bytes(data: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = data.to_vec();
    apply_mask(&mut out, mask);
    out
}
