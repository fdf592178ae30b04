//! XOR-fold content checksum.
//!
//! File content is digested in 2048-byte windows; every little-endian u32
//! word of each window is XOR-folded into a single accumulator. Zero words
//! are XOR identities, so zero padding and unwritten holes never change the
//! digest, and empty content folds to zero — the value a freshly allocated
//! inode carries in its checksum field.

/// Content is read and folded in windows of this many bytes.
pub const CHECKSUM_WINDOW: usize = 2048;

/// Streaming XOR-fold accumulator.
///
/// Callers feed whole windows; only the final window may be short, and it
/// is zero-padded to word width before folding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContentChecksum(u32);

impl ContentChecksum {
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Fold one window of content into the accumulator.
    pub fn fold(&mut self, window: &[u8]) {
        for chunk in window.chunks(4) {
            let mut word = [0_u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.0 ^= u32::from_le_bytes(word);
        }
    }

    #[must_use]
    pub fn finish(self) -> u32 {
        self.0
    }
}
