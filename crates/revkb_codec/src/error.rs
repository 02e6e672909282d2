//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode value to CBOR.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode CBOR bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// A frame did not start with the expected magic bytes.
    #[error("bad frame magic at offset {offset}")]
    BadMagic {
        /// Byte offset of the frame.
        offset: u64,
    },

    /// A frame checksum did not match its payload.
    #[error("checksum mismatch at offset {offset}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Byte offset of the frame.
        offset: u64,
        /// Stored checksum.
        expected: u32,
        /// Checksum computed over the payload.
        actual: u32,
    },

    /// Input ended in the middle of a frame.
    #[error("truncated frame at offset {offset}")]
    Truncated {
        /// Byte offset of the frame.
        offset: u64,
    },

    /// A value had a different shape than required.
    #[error("unexpected value: expected {expected}, found {found}")]
    UnexpectedValue {
        /// What the caller needed.
        expected: &'static str,
        /// What was found.
        found: String,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }

    /// Returns true if this error marks an incomplete trailing frame.
    #[must_use]
    pub fn is_truncation(&self) -> bool {
        matches!(self, Self::Truncated { .. })
    }
}
