//! UTF-8 validation for text messages and close reasons
//!
//! Complete payloads go through `simdutf8`'s fast path. Fragmented text
//! messages are checked incrementally as continuation frames arrive, so an
//! invalid sequence fails the connection without waiting for the final frame.

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Check if data is valid UTF-8 with an incomplete sequence allowed at the end
///
/// Returns:
/// - (true, n) if all complete sequences are valid, where n is the number of
///   trailing bytes that form an incomplete sequence (0-3 bytes)
/// - (false, 0) if there's an invalid UTF-8 sequence
pub fn validate_utf8_incomplete(data: &[u8]) -> (bool, usize) {
    match simdutf8::compat::from_utf8(data) {
        Ok(_) => (true, 0),
        Err(e) if e.error_len().is_none() => (true, data.len() - e.valid_up_to()),
        Err(_) => (false, 0),
    }
}

/// Incremental validator over a growing reassembly buffer
///
/// Remembers how far the buffer has been proven valid, so each fragment only
/// costs its own length (plus at most three carried-over bytes).
#[derive(Debug, Default, Clone)]
pub struct Utf8Stream {
    checked: usize,
}

impl Utf8Stream {
    /// Create a validator positioned at the start of a message
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate bytes appended to `buf` since the last call.
    ///
    /// Returns false as soon as an invalid sequence is seen.
    pub fn feed(&mut self, buf: &[u8]) -> bool {
        let tail = &buf[self.checked.min(buf.len())..];
        let (valid, incomplete) = validate_utf8_incomplete(tail);
        if valid {
            self.checked += tail.len() - incomplete;
        }
        valid
    }

    /// Validate the final state of `buf`; a dangling partial sequence fails
    pub fn finish(&mut self, buf: &[u8]) -> bool {
        let ok = self.feed(buf) && self.checked == buf.len();
        self.reset();
        ok
    }

    /// Forget progress, ready for the next message
    pub fn reset(&mut self) {
        self.checked = 0;
    }
}
