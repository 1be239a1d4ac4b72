//! Fixed header for the CUESYNC wire protocol
//!
//! Fixed header is 12 bytes:
//! - Bytes 0-1: Magic (0xC5 0x1C)
//! - Byte 2: Version
//! - Byte 3: Message kind
//! - Bytes 4-11: Source node ID (LE)

use cuesync_core::{NodeId, WireError, WireResult};

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Frame magic
pub const MAGIC: [u8; 2] = [0xC5, 0x1C];

/// Current wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Message kind identifiers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Hello = 0x01,
    Heartbeat = 0x02,
    Probe = 0x03,
    ProbeReply = 0x04,
    Dispatch = 0x05,
    Ack = 0x06,
    Nack = 0x07,
}

impl MessageKind {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(MessageKind::Hello),
            0x02 => Some(MessageKind::Heartbeat),
            0x03 => Some(MessageKind::Probe),
            0x04 => Some(MessageKind::ProbeReply),
            0x05 => Some(MessageKind::Dispatch),
            0x06 => Some(MessageKind::Ack),
            0x07 => Some(MessageKind::Nack),
            _ => None,
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// Fixed header structure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub kind: MessageKind,
    /// Sender node ID
    pub source: NodeId,
}

impl Header {
    pub fn new(kind: MessageKind, source: NodeId) -> Self {
        Header {
            version: WIRE_VERSION,
            kind,
            source,
        }
    }

    /// Parse header from bytes
    pub fn parse(buf: &[u8]) -> WireResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        // Bytes 0-1: Magic
        if buf[0..2] != MAGIC {
            return Err(WireError::BadMagic(u16::from_be_bytes([buf[0], buf[1]])));
        }

        // Byte 2: Version
        let version = buf[2];
        if version != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        // Byte 3: Kind
        let kind = MessageKind::from_byte(buf[3]).ok_or(WireError::UnknownKind(buf[3]))?;

        // Bytes 4-11: Source
        let mut id = [0u8; 8];
        id.copy_from_slice(&buf[4..12]);
        let source = NodeId::from_bytes(id);

        Ok(Header {
            version,
            kind,
            source,
        })
    }

    /// Serialize header to bytes
    pub fn serialize(&self, buf: &mut [u8]) -> WireResult<()> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::BufferTooShort {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.version;
        buf[3] = self.kind.to_byte();
        buf[4..12].copy_from_slice(&self.source.to_bytes());

        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&MAGIC);
        buf[2] = self.version;
        buf[3] = self.kind.to_byte();
        buf[4..12].copy_from_slice(&self.source.to_bytes());
        buf
    }
}
