//! Protocol error types

use thiserror::Error;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The stream ended in the middle of a value
    #[error("Truncated stream: input ended inside a value at offset {offset}")]
    TruncatedStream { offset: usize },

    /// Bytes that do not form a valid encoded value
    #[error("Malformed encoding at offset {offset}: {reason}")]
    MalformedEncoding { offset: usize, reason: &'static str },

    /// Byte-string length exceeds the allowed maximum
    #[error("Payload too large: {size} bytes exceeds maximum of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// A decoded value was not a map, so it cannot be a message
    #[error("Expected a message map, got {0}")]
    NotAMessage(&'static str),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn malformed(offset: usize, reason: &'static str) -> Self {
        Self::MalformedEncoding { offset, reason }
    }
}
