//! Error types for wire encoding and decoding.
//!
//! Every error here rejects a single record or message. Nothing in this
//! crate reads past the bytes it was given, whatever a length field claims.

use thiserror::Error;

/// Result type for wire operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while encoding or decoding control-channel messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Fewer bytes than a fixed-size header needs.
    #[error("truncated: need {needed} bytes, have {remaining}")]
    Truncated { needed: usize, remaining: usize },

    /// A record declares more value bytes than remain in the buffer.
    #[error("record of type {ty} declares {declared} bytes but only {remaining} remain")]
    LengthOverflow {
        ty: u8,
        declared: u32,
        remaining: usize,
    },

    /// A required record is absent.
    #[error("missing required record of type {0}")]
    MissingField(u8),

    /// A record is present but its value has the wrong size or content.
    #[error("bad value for record of type {ty}: {reason}")]
    BadValue { ty: u8, reason: &'static str },

    /// The message type byte is not one this protocol defines.
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    /// The output buffer cannot take the record.
    #[error("buffer full: need {needed} bytes, {remaining} available")]
    BufferFull { needed: usize, remaining: usize },

    /// A value longer than a 32-bit length can describe.
    #[error("value of {0} bytes does not fit a record")]
    ValueTooLarge(usize),

    /// A socket address image with an unknown family or length.
    #[error("invalid socket address image")]
    InvalidAddress,
}
