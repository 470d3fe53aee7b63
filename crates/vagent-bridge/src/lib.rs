//! vagent-bridge: wire framing for the host/guest RPC channel.
//!
//! Host and guest share a single duplex byte stream (virtio-serial port,
//! ISA serial port or a local socket). Each message on that stream is an
//! HTTP/1.1-looking frame prefixed with a sentinel byte so that a reader
//! which lost alignment can scan forward to the next frame start.
//!
//! # Architecture
//!
//! - **protocol**: Frame, FrameKind, Tag and the bit-exact header format
//! - **codec**: read state machine (resync, header, body) as a tokio-util codec
//! - **writer**: send state machine (header, then body) with partial-write offsets
//! - **error**: framing and tag errors

pub mod codec;
pub mod error;
pub mod protocol;
pub mod writer;

pub use codec::{Decoded, FrameCodec, ReadState};
pub use error::{FrameError, TagError};
pub use protocol::{Frame, FrameKind, FrameLimits, Tag, TagGenerator};
pub use writer::{OutgoingFrame, SendState};
