//! Errors from parsing RESP replies.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The buffer ends mid-frame. Read more and retry.
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("invalid type prefix: {0:#04x}")]
    InvalidPrefix(u8),

    #[error("invalid integer encoding")]
    InvalidInteger,

    /// A negative length other than the `-1` nil marker.
    #[error("invalid frame length: {0}")]
    InvalidFrameLength(i64),

    #[error("declared length {0} exceeds limit")]
    TooLarge(i64),

    /// Bulk payload not followed by `\r\n`.
    #[error("bulk string missing terminator")]
    MissingTerminator,

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("frame nested deeper than {0} levels")]
    NestingTooDeep(usize),
}
