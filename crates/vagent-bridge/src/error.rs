//! Error types for the wire protocol.

use thiserror::Error;

/// Why a correlation tag was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("tag is empty")]
    Empty,

    #[error("tag is {len} bytes, maximum is {max}")]
    TooLong { len: usize, max: usize },

    /// Tags travel inside a header line, so only visible ASCII is allowed.
    #[error("tag contains invalid byte 0x{0:02x}")]
    InvalidByte(u8),
}

/// Frame-level errors.
///
/// None of these are fatal to the channel: the decoder drops the partial
/// frame, re-enters resync and reports the error as a discarded item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("header exceeds {limit} bytes")]
    HeaderTooLong { limit: usize },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("missing Content-Length header")]
    MissingContentLength,

    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),

    #[error("content length {len} exceeds maximum of {limit} bytes")]
    ContentTooLong { len: usize, limit: usize },

    #[error("invalid tag: {0}")]
    InvalidTag(#[from] TagError),

    /// The body was consumed to keep the stream aligned, then dropped.
    #[error("unknown status line: {0:?}")]
    UnknownStatusLine(String),

    #[error("stream ended inside a header after {read} bytes")]
    TruncatedHeader { read: usize },

    #[error("stream ended inside a body: read {read} of {expected} bytes")]
    TruncatedBody { read: usize, expected: usize },
}
