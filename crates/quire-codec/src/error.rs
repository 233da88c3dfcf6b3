//! Decode and encode failures.

use thiserror::Error;

/// Anything that goes wrong turning bytes into updates or back.
///
/// Every variant is a decode failure from the caller's point of view: the
/// bytes are discarded and the peer's full state is requested instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported format version {found} (supported: {supported})")]
    UnsupportedVersion { found: u8, supported: u8 },

    #[error("truncated input: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("{field} is {len} bytes, longer than the wire format allows")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("unknown op type {0}")]
    UnknownOpType(u8),

    #[error("header says op type {header}, payload carries {payload}")]
    KindMismatch { header: u8, payload: u8 },

    #[error("expected envelope tag {expected:#04x}, found {found:#04x}")]
    UnexpectedTag { expected: u8, found: u8 },

    #[error("{0} trailing bytes")]
    TrailingBytes(usize),

    #[error("payload: {0}")]
    Payload(String),
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        CodecError::Payload(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
