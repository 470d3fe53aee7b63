//! Frame codec for the host/guest channel.
//!
//! The decoder is a three-state machine:
//!
//! - **Resync**: discard bytes until a sentinel is found.
//! - **HeaderAccumulate**: collect header bytes until a blank line. A
//!   sentinel seen here means the previous frame was cut short, so the
//!   partial header is dropped and accumulation starts over.
//! - **BodyRead**: collect exactly `Content-Length` bytes.
//!
//! Malformed frames never fail the stream. They are reported as
//! [`Decoded::Discarded`] and the decoder goes back to resync, which keeps
//! `FramedRead` alive across a corrupted or misaligned peer.

use std::io;

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FrameError;
use crate::protocol::{
    CONTENT_LENGTH, CONTENT_TYPE, DEFAULT_CONTENT_TYPE, Frame, FrameKind, FrameLimits, HEADER_END,
    SENTINEL, TAG_HEADER, Tag,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    Resync,
    HeaderAccumulate,
    BodyRead,
}

/// One item produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Frame(Frame),
    /// A frame was dropped. The decoder has already resynchronized.
    Discarded(FrameError),
}

/// Header fields of the frame whose body is being read.
#[derive(Debug)]
struct PendingBody {
    /// `Err` carries the unrecognized status line; the body is read and dropped.
    kind: Result<FrameKind, String>,
    tag: Tag,
    content_type: String,
    expected: usize,
    body: BytesMut,
}

/// Reads and writes sentinel-prefixed frames.
#[derive(Debug)]
pub struct FrameCodec {
    limits: FrameLimits,
    state: ReadState,
    header: Vec<u8>,
    pending: Option<PendingBody>,
    skipped: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_limits(FrameLimits::default())
    }

    pub fn with_limits(limits: FrameLimits) -> Self {
        Self {
            limits,
            state: ReadState::Resync,
            header: Vec::new(),
            pending: None,
            skipped: 0,
        }
    }

    pub fn limits(&self) -> FrameLimits {
        self.limits
    }

    pub fn read_state(&self) -> ReadState {
        self.state
    }

    /// Drop any partial frame and go back to scanning for a sentinel.
    pub fn reset(&mut self) {
        self.state = ReadState::Resync;
        self.header.clear();
        self.pending = None;
    }

    fn discard(&mut self, err: FrameError) -> Option<Decoded> {
        tracing::warn!(error = %err, "Discarding frame");
        self.reset();
        Some(Decoded::Discarded(err))
    }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ReadState::Resync => match src.iter().position(|&b| b == SENTINEL) {
                    Some(pos) => {
                        self.skipped += pos;
                        src.advance(pos + 1);
                        if self.skipped > 0 {
                            tracing::debug!(skipped = self.skipped, "Resynchronized on sentinel");
                            self.skipped = 0;
                        }
                        self.header.clear();
                        self.state = ReadState::HeaderAccumulate;
                    }
                    None => {
                        self.skipped += src.len();
                        src.clear();
                        return Ok(None);
                    }
                },
                ReadState::HeaderAccumulate => {
                    let mut complete = false;
                    while src.has_remaining() {
                        let b = src.get_u8();
                        if b == SENTINEL {
                            tracing::warn!(
                                dropped = self.header.len(),
                                "Truncated header, restarting at new sentinel"
                            );
                            self.header.clear();
                            continue;
                        }
                        self.header.push(b);
                        if self.header.ends_with(HEADER_END) {
                            complete = true;
                            break;
                        }
                        if self.header.len() >= self.limits.max_header_len {
                            let limit = self.limits.max_header_len;
                            return Ok(self.discard(FrameError::HeaderTooLong { limit }));
                        }
                    }
                    if !complete {
                        return Ok(None);
                    }
                    match parse_header(&self.header, &self.limits) {
                        Ok(pending) => {
                            self.header.clear();
                            self.pending = Some(pending);
                            self.state = ReadState::BodyRead;
                        }
                        Err(err) => return Ok(self.discard(err)),
                    }
                }
                ReadState::BodyRead => {
                    let Some(pending) = self.pending.as_mut() else {
                        self.reset();
                        continue;
                    };
                    let want = pending.expected - pending.body.len();
                    let take = want.min(src.len());
                    pending.body.extend_from_slice(&src.split_to(take));
                    if pending.body.len() < pending.expected {
                        return Ok(None);
                    }

                    let Some(done) = self.pending.take() else {
                        continue;
                    };
                    self.reset();
                    return Ok(Some(match done.kind {
                        Ok(kind) => {
                            let frame = Frame {
                                kind,
                                tag: done.tag,
                                content_type: done.content_type,
                                body: done.body.freeze(),
                            };
                            tracing::trace!(
                                kind = %frame.kind,
                                tag = %frame.tag,
                                len = frame.body.len(),
                                "Decoded frame"
                            );
                            Decoded::Frame(frame)
                        }
                        Err(line) => {
                            let err = FrameError::UnknownStatusLine(line);
                            tracing::warn!(error = %err, tag = %done.tag, "Discarding frame");
                            Decoded::Discarded(err)
                        }
                    }));
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(item) = self.decode(src)? {
            return Ok(Some(item));
        }
        let err = match self.state {
            ReadState::Resync => None,
            ReadState::HeaderAccumulate => Some(FrameError::TruncatedHeader {
                read: self.header.len(),
            }),
            ReadState::BodyRead => self.pending.as_ref().map(|p| FrameError::TruncatedBody {
                read: p.body.len(),
                expected: p.expected,
            }),
        };
        self.reset();
        Ok(err.map(Decoded::Discarded))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.body.len() > self.limits.max_content_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                FrameError::ContentTooLong {
                    len: frame.body.len(),
                    limit: self.limits.max_content_len,
                },
            ));
        }
        let header = frame.encode_header();
        dst.reserve(header.len() + frame.body.len());
        dst.extend_from_slice(&header);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}

fn parse_header(raw: &[u8], limits: &FrameLimits) -> Result<PendingBody, FrameError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| FrameError::MalformedHeader("header is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n").filter(|l| !l.is_empty());

    let status = lines
        .next()
        .ok_or_else(|| FrameError::MalformedHeader("empty header".to_string()))?;
    let kind = FrameKind::from_status_line(status).ok_or_else(|| status.to_string());

    let mut content_len = None;
    let mut content_type = None;
    let mut tag = None;

    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case(CONTENT_LENGTH) {
            let len: usize = value
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
            content_len = Some(len);
        } else if name.eq_ignore_ascii_case(CONTENT_TYPE) {
            content_type = Some(value.to_string());
        } else if name.eq_ignore_ascii_case(TAG_HEADER) {
            tag = Some(Tag::new(value)?);
        }
    }

    let expected = content_len.ok_or(FrameError::MissingContentLength)?;
    if expected > limits.max_content_len {
        return Err(FrameError::ContentTooLong {
            len: expected,
            limit: limits.max_content_len,
        });
    }

    Ok(PendingBody {
        kind,
        tag: tag.unwrap_or_else(Tag::none),
        content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        expected,
        body: BytesMut::with_capacity(expected),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn encoded(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame, &mut buf).unwrap();
        buf
    }

    fn hello() -> Frame {
        Frame::response(Tag::new("1.100").unwrap(), "application/json", "HELLO")
    }

    fn expect_frame(item: Option<Decoded>) -> Frame {
        match item {
            Some(Decoded::Frame(f)) => f,
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn decodes_encoded_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = encoded(hello());

        let frame = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(frame.kind, FrameKind::Response);
        assert_eq!(frame.tag.as_str(), "1.100");
        assert_eq!(frame.body, Bytes::from_static(b"HELLO"));
        assert!(buf.is_empty());
        assert_eq!(codec.read_state(), ReadState::Resync);
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x42u8; 50][..]);
        buf.extend_from_slice(&encoded(hello()));

        let frame = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(frame, hello());
    }

    #[test]
    fn request_after_garbage_is_delivered_unmodified() {
        let request = Frame::request(
            Tag::new("7f3a9c01.12").unwrap(),
            "application/json",
            r#"{"method":"va.getfile","params":{"path":"/etc/hostname"}}"#,
        );
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\x00\r\n\r\nPOST junk\r\n"[..]);
        buf.extend_from_slice(&[0x5a; 200]);
        buf.extend_from_slice(&encoded(request.clone()));

        let frame = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame, request);
        assert!(buf.is_empty());
        assert_eq!(codec.read_state(), ReadState::Resync);
    }

    #[test]
    fn byte_at_a_time_delivery() {
        let mut codec = FrameCodec::new();
        let wire = encoded(hello());
        let mut buf = BytesMut::new();
        let mut frames = Vec::new();

        for b in wire.iter() {
            buf.extend_from_slice(&[*b]);
            if let Some(item) = codec.decode(&mut buf).unwrap() {
                frames.push(item);
            }
        }
        assert_eq!(frames, vec![Decoded::Frame(hello())]);
    }

    #[test]
    fn sentinel_inside_header_restarts_frame() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\xffPOST /RPC2 HTTP/1.1\r\nContent-Le"[..]);
        buf.extend_from_slice(&encoded(hello()));

        let frame = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(frame, hello());
    }

    #[test]
    fn oversized_content_length_is_discarded() {
        let limits = FrameLimits {
            max_header_len: 4096,
            max_content_len: 16,
        };
        let mut codec = FrameCodec::with_limits(limits);
        let mut buf = BytesMut::from(
            &b"\xffHTTP/1.1 200 OK\r\nContent-Length: 1000\r\nX-Agent-Tag: big\r\n\r\n"[..],
        );
        buf.extend_from_slice(&encoded(hello()));

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Discarded(FrameError::ContentTooLong {
                len: 1000,
                limit: 16
            }))
        );
        assert_eq!(codec.read_state(), ReadState::Resync);
        assert_eq!(expect_frame(codec.decode(&mut buf).unwrap()), hello());
    }

    #[test]
    fn missing_and_invalid_content_length() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\xffHTTP/1.1 200 OK\r\nX-Agent-Tag: a\r\n\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Discarded(FrameError::MissingContentLength))
        );

        let mut buf = BytesMut::from(&b"\xffHTTP/1.1 200 OK\r\nContent-Length: -3\r\n\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Discarded(FrameError::InvalidContentLength(
                "-3".to_string()
            )))
        );
    }

    #[test]
    fn header_too_long_is_discarded() {
        let limits = FrameLimits {
            max_header_len: 32,
            max_content_len: 1024,
        };
        let mut codec = FrameCodec::with_limits(limits);
        let mut buf = BytesMut::from(&b"\xffPOST /RPC2 HTTP/1.1\r\nX-Padding: "[..]);
        buf.extend_from_slice(&[b'a'; 64]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Discarded(FrameError::HeaderTooLong { limit: 32 }))
        );
    }

    #[test]
    fn unknown_status_line_consumes_body() {
        let mut codec = FrameCodec::new();
        let mut buf =
            BytesMut::from(&b"\xffGET / HTTP/1.1\r\nContent-Length: 4\r\n\r\nBODY"[..]);
        buf.extend_from_slice(&encoded(hello()));

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Decoded::Discarded(FrameError::UnknownStatusLine(
                "GET / HTTP/1.1".to_string()
            )))
        );
        assert_eq!(expect_frame(codec.decode(&mut buf).unwrap()), hello());
    }

    #[test]
    fn missing_tag_and_content_type_use_defaults() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"\xffPOST /RPC2 HTTP/1.1\r\ncontent-length: 2\r\n\r\n{}"[..]);

        let frame = expect_frame(codec.decode(&mut buf).unwrap());
        assert_eq!(frame.kind, FrameKind::Request);
        assert_eq!(frame.tag, Tag::none());
        assert_eq!(frame.content_type, DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn empty_body_frame() {
        let mut codec = FrameCodec::new();
        let frame = Frame::request(Tag::new("e").unwrap(), "application/json", Bytes::new());
        let mut buf = encoded(frame.clone());

        assert_eq!(expect_frame(codec.decode(&mut buf).unwrap()), frame);
    }

    #[test]
    fn eof_mid_body_reports_truncation() {
        let mut codec = FrameCodec::new();
        let wire = encoded(hello());
        let mut buf = BytesMut::from(&wire[..wire.len() - 2]);

        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        assert_eq!(codec.read_state(), ReadState::BodyRead);
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap(),
            Some(Decoded::Discarded(FrameError::TruncatedBody {
                read: 3,
                expected: 5
            }))
        );
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn eof_in_resync_is_clean() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&b"noise"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn encoder_rejects_oversized_body() {
        let limits = FrameLimits {
            max_header_len: 4096,
            max_content_len: 4,
        };
        let mut codec = FrameCodec::with_limits(limits);
        let mut buf = BytesMut::new();
        let err = codec.encode(hello(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn framed_read_survives_corrupt_frames() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"junk");
        wire.extend_from_slice(b"\xffHTTP/1.1 200 OK\r\nbad header line\r\n\r\n");
        wire.extend_from_slice(&encoded(hello()));

        let mut reader = FramedRead::new(&wire[..], FrameCodec::new());
        let first = reader.next().await.unwrap().unwrap();
        assert!(matches!(
            first,
            Decoded::Discarded(FrameError::MalformedHeader(_))
        ));
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second, Decoded::Frame(hello()));
        assert!(reader.next().await.is_none());
    }
}
