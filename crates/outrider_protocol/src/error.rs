//! Protocol error types.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised by the frame codec and message model.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("length prefix must be exactly {expected} bytes, got {got}")]
    LengthPrefixSize { expected: usize, got: usize },

    #[error("frame length is negative: {0}")]
    NegativeLength(i32),

    #[error("buffer too short to hold a frame: {got} bytes")]
    FrameTooShort { got: usize },

    #[error("frame length mismatch: prefix declares {declared} payload bytes, buffer holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame length {len} exceeds maximum {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("payload too large to frame: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("message is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}
