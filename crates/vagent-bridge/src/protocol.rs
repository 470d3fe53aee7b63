//! Wire protocol types for host/guest communication.
//!
//! A frame is a single sentinel byte followed by an HTTP/1.1-style header
//! block and a body of exactly `Content-Length` bytes:
//!
//! ```text
//! 0xFF "POST /RPC2 HTTP/1.1" CRLF          (request)
//! 0xFF "HTTP/1.1 200 OK" CRLF              (response)
//! "Content-Type: " <type> CRLF
//! "Content-Length: " <decimal> CRLF
//! "X-Agent-Tag: " <tag> CRLF
//! CRLF
//! <body>
//! ```
//!
//! Both sides may issue requests on the same stream, so every frame carries
//! a tag and a response reuses the tag of the request it answers.

use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::TagError;

/// Marks the start of every frame. Never appears in a valid header.
pub const SENTINEL: u8 = 0xFF;

pub const REQUEST_LINE: &str = "POST /RPC2 HTTP/1.1";
pub const RESPONSE_LINE: &str = "HTTP/1.1 200 OK";

pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TAG_HEADER: &str = "X-Agent-Tag";

/// Used when a peer omits `Content-Type`.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Header block terminator.
pub const HEADER_END: &[u8] = b"\r\n\r\n";

pub const TAG_MAX_LEN: usize = 63;

/// Whether a frame carries a call or the answer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Request,
    Response,
}

impl FrameKind {
    pub fn status_line(self) -> &'static str {
        match self {
            FrameKind::Request => REQUEST_LINE,
            FrameKind::Response => RESPONSE_LINE,
        }
    }

    /// Classify a status line by its leading token.
    ///
    /// Anything starting with `POST` is a request and anything starting with
    /// `HTTP/` is a response. Other lines yield `None`.
    pub fn from_status_line(line: &str) -> Option<Self> {
        if line.starts_with("POST ") {
            Some(FrameKind::Request)
        } else if line.starts_with("HTTP/") {
            Some(FrameKind::Response)
        } else {
            None
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameKind::Request => write!(f, "request"),
            FrameKind::Response => write!(f, "response"),
        }
    }
}

/// Correlation tag carried in the `X-Agent-Tag` header.
///
/// Printable ASCII without spaces, 1 to 63 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(String);

impl Tag {
    /// Tag assumed for frames that arrive without an `X-Agent-Tag` header.
    pub const NONE: &'static str = "none";

    pub fn new(tag: impl Into<String>) -> Result<Self, TagError> {
        let tag = tag.into();
        validate_tag(&tag)?;
        Ok(Self(tag))
    }

    pub fn none() -> Self {
        Self(Self::NONE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn validate_tag(tag: &str) -> Result<(), TagError> {
    if tag.is_empty() {
        return Err(TagError::Empty);
    }
    if tag.len() > TAG_MAX_LEN {
        return Err(TagError::TooLong {
            len: tag.len(),
            max: TAG_MAX_LEN,
        });
    }
    if let Some(b) = tag.bytes().find(|b| !b.is_ascii_graphic()) {
        return Err(TagError::InvalidByte(b));
    }
    Ok(())
}

impl FromStr for Tag {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Tag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Tag {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Generates tags that are unique for the lifetime of a channel.
///
/// Tags look like `3f9a01c2.17`: a random per-channel prefix and a
/// monotonically increasing counter. The prefix keeps host-originated and
/// guest-originated tags apart when both sides issue calls at once.
#[derive(Debug)]
pub struct TagGenerator {
    prefix: String,
    next: u64,
}

impl TagGenerator {
    pub fn new() -> Self {
        let uuid = uuid::Uuid::new_v4();
        let prefix = uuid.simple().to_string()[..8].to_string();
        Self { prefix, next: 1 }
    }

    /// Use a fixed prefix. The prefix plus `.` plus a 20-digit counter must
    /// still fit in a tag.
    pub fn with_prefix(prefix: &str) -> Result<Self, TagError> {
        validate_tag(prefix)?;
        let max = TAG_MAX_LEN - 21;
        if prefix.len() > max {
            return Err(TagError::TooLong {
                len: prefix.len(),
                max,
            });
        }
        Ok(Self {
            prefix: prefix.to_string(),
            next: 1,
        })
    }

    /// Start counting at `next` instead of 1.
    pub fn starting_at(mut self, next: u64) -> Self {
        self.next = next;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn next_tag(&mut self) -> Tag {
        let n = self.next;
        self.next = self.next.wrapping_add(1);
        // Prefix was validated and the counter is digits, so this is a valid tag.
        Tag(format!("{}.{}", self.prefix, n))
    }
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Size limits applied while reading frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    /// Maximum header block size, sentinel excluded.
    pub max_header_len: usize,
    /// Maximum `Content-Length` accepted from a peer.
    pub max_content_len: usize,
}

impl FrameLimits {
    pub const DEFAULT_MAX_HEADER_LEN: usize = 4096;
    pub const DEFAULT_MAX_CONTENT_LEN: usize = 16 * 1024 * 1024;
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_len: Self::DEFAULT_MAX_HEADER_LEN,
            max_content_len: Self::DEFAULT_MAX_CONTENT_LEN,
        }
    }
}

/// A complete frame: header fields plus body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub tag: Tag,
    pub content_type: String,
    pub body: Bytes,
}

impl Frame {
    pub fn request(tag: Tag, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Request,
            tag,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn response(tag: Tag, content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Response,
            tag,
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == FrameKind::Request
    }

    /// Serialize sentinel, status line and headers, up to and including the
    /// blank line. The body is not included.
    pub fn encode_header(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.content_type.len());
        buf.put_u8(SENTINEL);
        buf.put_slice(self.kind.status_line().as_bytes());
        buf.put_slice(b"\r\n");
        put_header(&mut buf, CONTENT_TYPE, &self.content_type);
        put_header(&mut buf, CONTENT_LENGTH, &self.body.len().to_string());
        put_header(&mut buf, TAG_HEADER, self.tag.as_str());
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}
