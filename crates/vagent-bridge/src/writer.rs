//! Outgoing frame with partial-write tracking.
//!
//! The transport may accept fewer bytes than offered. `OutgoingFrame` keeps
//! the offset into the header, then the body, so the scheduler can resume
//! exactly where the last write stopped.

use bytes::Bytes;

use crate::protocol::{Frame, Tag};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    HeaderWrite,
    BodyWrite,
    Complete,
}

#[derive(Debug)]
pub struct OutgoingFrame {
    tag: Tag,
    header: Bytes,
    body: Bytes,
    state: SendState,
    offset: usize,
}

impl OutgoingFrame {
    pub fn new(frame: &Frame) -> Self {
        Self {
            tag: frame.tag.clone(),
            header: frame.encode_header(),
            body: frame.body.clone(),
            state: SendState::HeaderWrite,
            offset: 0,
        }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    pub fn state(&self) -> SendState {
        self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state == SendState::Complete
    }

    /// Bytes still to be written in the current section.
    ///
    /// Empty once the frame is complete.
    pub fn chunk(&self) -> Bytes {
        match self.state {
            SendState::HeaderWrite => self.header.slice(self.offset..),
            SendState::BodyWrite => self.body.slice(self.offset..),
            SendState::Complete => Bytes::new(),
        }
    }

    /// Total bytes left across header and body.
    pub fn remaining(&self) -> usize {
        match self.state {
            SendState::HeaderWrite => self.header.len() - self.offset + self.body.len(),
            SendState::BodyWrite => self.body.len() - self.offset,
            SendState::Complete => 0,
        }
    }

    /// Record that `n` bytes of the current chunk were written.
    pub fn advance(&mut self, n: usize) -> SendState {
        debug_assert!(n <= self.chunk().len(), "advanced past current chunk");
        self.offset += n;
        if self.state == SendState::HeaderWrite && self.offset >= self.header.len() {
            self.state = SendState::BodyWrite;
            self.offset = 0;
        }
        if self.state == SendState::BodyWrite && self.offset >= self.body.len() {
            self.state = SendState::Complete;
            self.offset = 0;
        }
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Decoded, FrameCodec};
    use bytes::BytesMut;
    use tokio_util::codec::Decoder;

    fn frame() -> Frame {
        Frame::response(Tag::new("1.100").unwrap(), "application/json", "HELLO")
    }

    #[test]
    fn partial_writes_resume_at_offset() {
        let mut out = OutgoingFrame::new(&frame());
        let header_len = frame().encode_header().len();
        let mut wire = BytesMut::new();

        // Three bytes at a time, like a congested serial port.
        while !out.is_complete() {
            let chunk = out.chunk();
            let n = chunk.len().min(3);
            wire.extend_from_slice(&chunk[..n]);
            out.advance(n);
        }

        assert_eq!(wire.len(), header_len + 5);
        let decoded = FrameCodec::new().decode(&mut wire).unwrap();
        assert_eq!(decoded, Some(Decoded::Frame(frame())));
    }

    #[test]
    fn state_transitions() {
        let mut out = OutgoingFrame::new(&frame());
        let header_len = out.chunk().len();
        assert_eq!(out.state(), SendState::HeaderWrite);
        assert_eq!(out.remaining(), header_len + 5);

        assert_eq!(out.advance(header_len - 1), SendState::HeaderWrite);
        assert_eq!(out.advance(1), SendState::BodyWrite);
        assert_eq!(out.chunk(), Bytes::from_static(b"HELLO"));
        assert_eq!(out.advance(5), SendState::Complete);
        assert!(out.chunk().is_empty());
        assert_eq!(out.remaining(), 0);
    }

    #[test]
    fn empty_body_completes_with_header() {
        let f = Frame::request(Tag::new("e").unwrap(), "application/json", Bytes::new());
        let mut out = OutgoingFrame::new(&f);
        let n = out.chunk().len();
        assert_eq!(out.advance(n), SendState::Complete);
    }
}
