//! Message bodies carried after the fixed header
//!
//! All integers are little endian. Timestamps are signed microseconds.
//!
//! | kind | body |
//! |---|---|
//! | Hello | entry count (u16), then per entry: key len (u8), key, tag (u8), value |
//! | Heartbeat | empty |
//! | Probe | seq (u32), epoch (u64), t1 (i64) |
//! | ProbeReply | seq (u32), epoch (u64), t1 (i64), t2 (i64), t3 (i64) |
//! | Dispatch | cue id (u64), cue kind (u8), execute_at (i64), tolerance us (u32), payload len (u16), payload |
//! | Ack | cue id (u64) |
//! | Nack | cue id (u64), reason len (u16), reason (UTF-8) |

use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use cuesync_core::{
    CapabilityDescriptor, CapabilityValue, CueId, CueKind, Epoch, LocalTime, NodeTime, WireError,
    WireResult,
};

use crate::MessageKind;

const TAG_FLAG: u8 = 0;
const TAG_NUMBER: u8 = 1;
const TAG_TEXT: u8 = 2;

/// Fixed part of a Dispatch body
pub const DISPATCH_BODY_OVERHEAD: usize = 8 + 1 + 8 + 4 + 2;

/// Widest tolerance a Dispatch body can carry
pub const MAX_DISPATCH_TOLERANCE: Duration = Duration::from_micros(u32::MAX as u64);

/// A cue delivery to one node, in that node's clock
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchBody {
    pub cue: CueId,
    pub kind: CueKind,
    pub execute_at: NodeTime,
    pub tolerance: Duration,
    pub payload: Bytes,
}

/// Protocol messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Node announcement with its capability descriptor
    Hello { capabilities: CapabilityDescriptor },
    Heartbeat,
    /// Clock probe, stamped with the local send time
    Probe { seq: u32, epoch: Epoch, t1: LocalTime },
    /// Probe echo with node receive and reply times
    ProbeReply {
        seq: u32,
        epoch: Epoch,
        t1: LocalTime,
        t2: NodeTime,
        t3: NodeTime,
    },
    Dispatch(DispatchBody),
    Ack { cue: CueId },
    /// Node refused a dispatch
    Nack { cue: CueId, reason: String },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Hello { .. } => MessageKind::Hello,
            Message::Heartbeat => MessageKind::Heartbeat,
            Message::Probe { .. } => MessageKind::Probe,
            Message::ProbeReply { .. } => MessageKind::ProbeReply,
            Message::Dispatch(_) => MessageKind::Dispatch,
            Message::Ack { .. } => MessageKind::Ack,
            Message::Nack { .. } => MessageKind::Nack,
        }
    }

    /// Append the encoded body to `buf`
    pub fn encode_body(&self, buf: &mut BytesMut) -> WireResult<()> {
        match self {
            Message::Hello { capabilities } => encode_capabilities(capabilities, buf)?,
            Message::Heartbeat => {}
            Message::Probe { seq, epoch, t1 } => {
                buf.put_u32_le(*seq);
                buf.put_u64_le(epoch.0);
                buf.put_i64_le(t1.as_micros());
            }
            Message::ProbeReply {
                seq,
                epoch,
                t1,
                t2,
                t3,
            } => {
                buf.put_u32_le(*seq);
                buf.put_u64_le(epoch.0);
                buf.put_i64_le(t1.as_micros());
                buf.put_i64_le(t2.as_micros());
                buf.put_i64_le(t3.as_micros());
            }
            Message::Dispatch(body) => {
                let tolerance = u32::try_from(body.tolerance.as_micros())
                    .map_err(|_| WireError::InvalidField("tolerance"))?;
                let len = u16::try_from(body.payload.len())
                    .map_err(|_| WireError::InvalidField("payload length"))?;
                buf.put_u64_le(body.cue.0);
                buf.put_u8(body.kind.to_byte());
                buf.put_i64_le(body.execute_at.as_micros());
                buf.put_u32_le(tolerance);
                buf.put_u16_le(len);
                buf.put_slice(&body.payload);
            }
            Message::Ack { cue } => buf.put_u64_le(cue.0),
            Message::Nack { cue, reason } => {
                let len = u16::try_from(reason.len())
                    .map_err(|_| WireError::InvalidField("nack reason"))?;
                buf.put_u64_le(cue.0);
                buf.put_u16_le(len);
                buf.put_slice(reason.as_bytes());
            }
        }
        Ok(())
    }

    /// Decode a body of the given kind. The whole buffer must be consumed.
    pub fn decode_body(kind: MessageKind, mut buf: Bytes) -> WireResult<Self> {
        let message = match kind {
            MessageKind::Hello => Message::Hello {
                capabilities: decode_capabilities(&mut buf)?,
            },
            MessageKind::Heartbeat => Message::Heartbeat,
            MessageKind::Probe => {
                need(&buf, 4 + 8 + 8)?;
                Message::Probe {
                    seq: buf.get_u32_le(),
                    epoch: Epoch(buf.get_u64_le()),
                    t1: LocalTime::from_micros(buf.get_i64_le()),
                }
            }
            MessageKind::ProbeReply => {
                need(&buf, 4 + 8 + 8 * 3)?;
                Message::ProbeReply {
                    seq: buf.get_u32_le(),
                    epoch: Epoch(buf.get_u64_le()),
                    t1: LocalTime::from_micros(buf.get_i64_le()),
                    t2: NodeTime::from_micros(buf.get_i64_le()),
                    t3: NodeTime::from_micros(buf.get_i64_le()),
                }
            }
            MessageKind::Dispatch => {
                need(&buf, DISPATCH_BODY_OVERHEAD)?;
                let cue = CueId(buf.get_u64_le());
                let kind_byte = buf.get_u8();
                let kind =
                    CueKind::from_byte(kind_byte).ok_or(WireError::UnknownCueKind(kind_byte))?;
                let execute_at = NodeTime::from_micros(buf.get_i64_le());
                let tolerance = Duration::from_micros(buf.get_u32_le() as u64);
                let len = buf.get_u16_le() as usize;
                need(&buf, len)?;
                let payload = buf.split_to(len);
                Message::Dispatch(DispatchBody {
                    cue,
                    kind,
                    execute_at,
                    tolerance,
                    payload,
                })
            }
            MessageKind::Ack => {
                need(&buf, 8)?;
                Message::Ack {
                    cue: CueId(buf.get_u64_le()),
                }
            }
            MessageKind::Nack => {
                need(&buf, 8 + 2)?;
                let cue = CueId(buf.get_u64_le());
                let len = buf.get_u16_le() as usize;
                let reason = read_string(&mut buf, len, "nack reason")?;
                Message::Nack { cue, reason }
            }
        };

        if buf.has_remaining() {
            return Err(WireError::TrailingBytes(buf.remaining()));
        }
        Ok(message)
    }
}

#[inline]
fn need(buf: &Bytes, n: usize) -> WireResult<()> {
    if buf.remaining() < n {
        return Err(WireError::BufferTooShort {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn read_string(buf: &mut Bytes, len: usize, field: &'static str) -> WireResult<String> {
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidField(field))
}

fn encode_capabilities(caps: &CapabilityDescriptor, buf: &mut BytesMut) -> WireResult<()> {
    let count =
        u16::try_from(caps.len()).map_err(|_| WireError::InvalidField("capability count"))?;
    buf.put_u16_le(count);

    for (name, value) in caps.iter() {
        let key_len =
            u8::try_from(name.len()).map_err(|_| WireError::InvalidField("capability key"))?;
        buf.put_u8(key_len);
        buf.put_slice(name.as_bytes());

        match value {
            CapabilityValue::Flag(v) => {
                buf.put_u8(TAG_FLAG);
                buf.put_u8(u8::from(*v));
            }
            CapabilityValue::Number(v) => {
                buf.put_u8(TAG_NUMBER);
                buf.put_i64_le(*v);
            }
            CapabilityValue::Text(v) => {
                let len = u16::try_from(v.len())
                    .map_err(|_| WireError::InvalidField("capability text"))?;
                buf.put_u8(TAG_TEXT);
                buf.put_u16_le(len);
                buf.put_slice(v.as_bytes());
            }
        }
    }
    Ok(())
}

fn decode_capabilities(buf: &mut Bytes) -> WireResult<CapabilityDescriptor> {
    need(buf, 2)?;
    let count = buf.get_u16_le();
    let mut caps = CapabilityDescriptor::new();

    for _ in 0..count {
        need(buf, 1)?;
        let key_len = buf.get_u8() as usize;
        let name = read_string(buf, key_len, "capability key")?;

        need(buf, 1)?;
        let value = match buf.get_u8() {
            TAG_FLAG => {
                need(buf, 1)?;
                match buf.get_u8() {
                    0 => CapabilityValue::Flag(false),
                    1 => CapabilityValue::Flag(true),
                    _ => return Err(WireError::InvalidField("capability flag")),
                }
            }
            TAG_NUMBER => {
                need(buf, 8)?;
                CapabilityValue::Number(buf.get_i64_le())
            }
            TAG_TEXT => {
                need(buf, 2)?;
                let len = buf.get_u16_le() as usize;
                CapabilityValue::Text(read_string(buf, len, "capability text")?)
            }
            _ => return Err(WireError::InvalidField("capability tag")),
        };
        caps.insert(name, value);
    }
    Ok(caps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) -> Message {
        let mut buf = BytesMut::new();
        message.encode_body(&mut buf).unwrap();
        Message::decode_body(message.kind(), buf.freeze()).unwrap()
    }

    #[test]
    fn test_probe_reply_body() {
        let reply = Message::ProbeReply {
            seq: 7,
            epoch: Epoch(3),
            t1: LocalTime::from_micros(-1_000),
            t2: NodeTime::from_micros(120_500),
            t3: NodeTime::from_micros(120_600),
        };

        let mut buf = BytesMut::new();
        reply.encode_body(&mut buf).unwrap();
        assert_eq!(buf.len(), 36);
        assert_eq!(&buf[0..4], &7u32.to_le_bytes());

        assert_eq!(Message::decode_body(MessageKind::ProbeReply, buf.freeze()).unwrap(), reply);
    }

    #[test]
    fn test_hello_capabilities() {
        let caps = CapabilityDescriptor::new()
            .with_cue_kind(CueKind::Lighting)
            .with_time_authority(true)
            .with_latency_budget(Duration::from_millis(15))
            .with_text("zone", "north-wall");

        let decoded = roundtrip(Message::Hello {
            capabilities: caps.clone(),
        });
        assert_eq!(decoded, Message::Hello { capabilities: caps });
    }

    #[test]
    fn test_nack_reason_utf8() {
        let nack = Message::Nack {
            cue: CueId(11),
            reason: "projector warming up".into(),
        };
        assert_eq!(roundtrip(nack.clone()), nack);

        let mut buf = BytesMut::new();
        buf.put_u64_le(11);
        buf.put_u16_le(2);
        buf.put_slice(&[0xFF, 0xFE]);
        assert_eq!(
            Message::decode_body(MessageKind::Nack, buf.freeze()),
            Err(WireError::InvalidField("nack reason"))
        );
    }

    #[test]
    fn test_dispatch_tolerance_limit() {
        let mut body = DispatchBody {
            cue: CueId(3),
            kind: CueKind::Trigger,
            execute_at: NodeTime::from_millis(10),
            tolerance: MAX_DISPATCH_TOLERANCE,
            payload: Bytes::from_static(b"x"),
        };
        let mut buf = BytesMut::new();
        assert!(Message::Dispatch(body.clone()).encode_body(&mut buf).is_ok());

        body.tolerance += Duration::from_micros(1);
        let mut buf = BytesMut::new();
        assert_eq!(
            Message::Dispatch(body).encode_body(&mut buf),
            Err(WireError::InvalidField("tolerance"))
        );
    }

    #[test]
    fn test_dispatch_unknown_cue_kind() {
        let mut buf = BytesMut::new();
        buf.put_u64_le(1);
        buf.put_u8(0x7F);
        buf.put_i64_le(0);
        buf.put_u32_le(0);
        buf.put_u16_le(0);
        assert_eq!(
            Message::decode_body(MessageKind::Dispatch, buf.freeze()),
            Err(WireError::UnknownCueKind(0x7F))
        );
    }

    #[test]
    fn test_truncated_and_trailing() {
        let mut buf = BytesMut::new();
        Message::Ack { cue: CueId(5) }.encode_body(&mut buf).unwrap();

        let short = buf.clone().freeze().slice(0..5);
        assert!(matches!(
            Message::decode_body(MessageKind::Ack, short),
            Err(WireError::BufferTooShort { .. })
        ));

        buf.put_u8(0);
        assert_eq!(
            Message::decode_body(MessageKind::Ack, buf.freeze()),
            Err(WireError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_tolerance_out_of_range() {
        let dispatch = Message::Dispatch(DispatchBody {
            cue: CueId(1),
            kind: CueKind::Audio,
            execute_at: NodeTime::ZERO,
            tolerance: Duration::from_secs(10_000),
            payload: Bytes::new(),
        });
        let mut buf = BytesMut::new();
        assert_eq!(
            dispatch.encode_body(&mut buf),
            Err(WireError::InvalidField("tolerance"))
        );
    }
}
