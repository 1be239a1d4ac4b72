//! Complete frame structure for the CUESYNC wire protocol
//!
//! Frame = Fixed Header + Message Body

use bytes::{BufMut, Bytes, BytesMut};
use cuesync_core::{NodeId, WireError, WireResult};

use crate::{Header, Message, DISPATCH_BODY_OVERHEAD, HEADER_SIZE};

/// Maximum frame size (MTU-friendly)
pub const MAX_FRAME_SIZE: usize = 1400;

/// Largest cue payload that fits in a single Dispatch frame
pub const MAX_DISPATCH_PAYLOAD: usize = MAX_FRAME_SIZE - HEADER_SIZE - DISPATCH_BODY_OVERHEAD;

/// Complete CUESYNC frame
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub message: Message,
}

impl Frame {
    pub fn new(source: NodeId, message: Message) -> Self {
        Frame {
            header: Header::new(message.kind(), source),
            message,
        }
    }

    pub fn source(&self) -> NodeId {
        self.header.source
    }

    /// Parse a frame. Dispatch payloads are sliced from `buf` without copying.
    pub fn parse(buf: Bytes) -> WireResult<Self> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let header = Header::parse(&buf)?;
        let message = Message::decode_body(header.kind, buf.slice(HEADER_SIZE..))?;

        Ok(Frame { header, message })
    }

    /// Serialize the frame
    pub fn serialize(&self) -> WireResult<Bytes> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);

        // Kind always follows the message
        let header = Header {
            kind: self.message.kind(),
            ..self.header
        };
        buf.put_slice(&header.to_bytes());
        self.message.encode_body(&mut buf)?;

        if buf.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(buf.freeze())
    }
}

/// Encode `message` from `source` in one step
pub fn encode(source: NodeId, message: Message) -> WireResult<Bytes> {
    Frame::new(source, message).serialize()
}
