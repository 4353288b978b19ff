//! Error types for data parsing in cgm-types.

use thiserror::Error;

/// Errors that can occur when decoding raw sensor bytes.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific or cryptographic errors (those belong in cgm-core).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The buffer is shorter than the structure being decoded.
    #[error("Insufficient bytes: expected {expected}, got {actual}")]
    InsufficientBytes {
        /// Number of bytes required.
        expected: usize,
        /// Number of bytes available.
        actual: usize,
    },

    /// A bit range reaches past the end of the buffer.
    #[error(
        "Bit range out of bounds: {bit_count} bits at byte {byte_offset} bit {bit_offset} in a {len}-byte buffer"
    )]
    OutOfBounds {
        /// Byte offset of the range start.
        byte_offset: usize,
        /// Bit offset within that byte.
        bit_offset: usize,
        /// Number of bits requested.
        bit_count: usize,
        /// Length of the buffer in bytes.
        len: usize,
    },

    /// A decoded value is malformed.
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using cgm-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
