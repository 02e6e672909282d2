//! Checksummed record framing for append-only journals.
//!
//! Frame layout:
//!
//! ```text
//! | magic (4) | length (u32 LE) | payload (length bytes) | crc32 (u32 LE) |
//! ```
//!
//! The checksum covers the payload only.

use crc32fast::Hasher;

use crate::error::{CodecError, CodecResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"RKBF";

/// Bytes of framing around a payload.
pub const FRAME_OVERHEAD: usize = 12;

/// Computes a CRC32 checksum over the provided data.
#[must_use]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Wraps a payload in a frame.
#[must_use]
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    out.extend_from_slice(&FRAME_MAGIC);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&compute_checksum(payload).to_le_bytes());
    out
}

/// Iterates over the frames of a byte buffer.
///
/// A frame cut short by the end of the buffer yields
/// [`CodecError::Truncated`]; readers recovering a journal treat that as the
/// end of valid data.
#[derive(Debug)]
pub struct FrameReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> FrameReader<'a> {
    /// Creates a reader over `data`.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    /// Offset of the next unread frame.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn read_u32(&self, at: usize) -> Option<u32> {
        let bytes = self.data.get(at..at + 4)?;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(bytes);
        Some(u32::from_le_bytes(buf))
    }

    fn next_frame(&mut self) -> CodecResult<&'a [u8]> {
        let start = self.offset;
        let offset = start as u64;
        let magic = self
            .data
            .get(start..start + 4)
            .ok_or(CodecError::Truncated { offset })?;
        if magic != FRAME_MAGIC {
            return Err(CodecError::BadMagic { offset });
        }
        let len = self
            .read_u32(start + 4)
            .ok_or(CodecError::Truncated { offset })? as usize;
        let payload_start = start + 8;
        let payload = self
            .data
            .get(payload_start..payload_start + len)
            .ok_or(CodecError::Truncated { offset })?;
        let expected = self
            .read_u32(payload_start + len)
            .ok_or(CodecError::Truncated { offset })?;
        let actual = compute_checksum(payload);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch {
                offset,
                expected,
                actual,
            });
        }
        self.offset = payload_start + len + 4;
        Ok(payload)
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = CodecResult<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        Some(self.next_frame())
    }
}
