//! Binary codec for the datagram protocol.
//!
//! Every datagram is a single message: a 1-byte tag followed by fixed
//! little-endian fields. The layout is part of the protocol contract and is
//! written out by hand; there is no schema or serialization framework behind
//! it.
//!
//! | Tag  | Message       | Payload                                       |
//! |------|---------------|-----------------------------------------------|
//! | 0x01 | SyncRequest   | u32 nonce                                     |
//! | 0x02 | SyncReply     | u32 nonce                                     |
//! | 0x03 | InputBatch    | u32 start_frame, u32 end_frame, u16 length, bytes\[length\] |
//! | 0x04 | InputAck      | u32 frame                                     |
//! | 0x05 | QualityReport | u32 frame, i32 advantage                      |
//! | 0x06 | QualityReply  | u32 frame                                     |
//!
//! Decoding is total: any datagram that does not parse yields a
//! [`DecodeError`] and is discarded by the session, never surfaced as a
//! session failure.

use bytes::{Buf, BufMut};
use std::fmt;

use crate::network::messages::Message;
use crate::Frame;

const TAG_SYNC_REQUEST: u8 = 0x01;
const TAG_SYNC_REPLY: u8 = 0x02;
const TAG_INPUT_BATCH: u8 = 0x03;
const TAG_INPUT_ACK: u8 = 0x04;
const TAG_QUALITY_REPORT: u8 = 0x05;
const TAG_QUALITY_REPLY: u8 = 0x06;

/// Why a datagram failed to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DecodeError {
    /// The datagram was empty.
    Empty,
    /// The leading tag byte does not name a known message.
    UnknownTag(u8),
    /// The datagram ended before the message's fixed fields.
    Truncated {
        /// Bytes the message layout requires after the tag.
        expected: usize,
        /// Bytes actually present after the tag.
        actual: usize,
    },
    /// The declared payload length disagrees with the datagram size.
    LengthMismatch {
        /// The length field's value.
        declared: usize,
        /// Payload bytes actually present.
        actual: usize,
    },
    /// A frame field does not fit a signed 32-bit frame number.
    FrameOutOfRange(u32),
    /// An input batch whose end frame precedes its start frame.
    BadFrameRange {
        /// Declared first frame.
        start: u32,
        /// Declared last frame.
        end: u32,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty datagram"),
            Self::UnknownTag(tag) => write!(f, "unknown message tag {:#04x}", tag),
            Self::Truncated { expected, actual } => {
                write!(f, "truncated message: need {} bytes, got {}", expected, actual)
            }
            Self::LengthMismatch { declared, actual } => {
                write!(
                    f,
                    "payload length mismatch: declared {}, got {}",
                    declared, actual
                )
            }
            Self::FrameOutOfRange(value) => {
                write!(f, "frame {} exceeds the valid frame range", value)
            }
            Self::BadFrameRange { start, end } => {
                write!(f, "input batch range {}..={} is inverted", start, end)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encodes a message into a fresh datagram buffer.
///
/// The caller must keep `InputBatch` payloads within `u16::MAX` bytes; the
/// engine's redundancy window guarantees this by construction.
#[must_use]
pub fn encode(msg: &Message) -> Vec<u8> {
    match msg {
        Message::SyncRequest { nonce } => {
            let mut buf = Vec::with_capacity(5);
            buf.put_u8(TAG_SYNC_REQUEST);
            buf.put_u32_le(*nonce);
            buf
        }
        Message::SyncReply { nonce } => {
            let mut buf = Vec::with_capacity(5);
            buf.put_u8(TAG_SYNC_REPLY);
            buf.put_u32_le(*nonce);
            buf
        }
        Message::InputBatch {
            start_frame,
            end_frame,
            bytes,
        } => {
            debug_assert!(bytes.len() <= u16::MAX as usize);
            let mut buf = Vec::with_capacity(11 + bytes.len());
            buf.put_u8(TAG_INPUT_BATCH);
            buf.put_u32_le(start_frame.as_i32() as u32);
            buf.put_u32_le(end_frame.as_i32() as u32);
            buf.put_u16_le(bytes.len() as u16);
            buf.put_slice(bytes);
            buf
        }
        Message::InputAck { frame } => {
            let mut buf = Vec::with_capacity(5);
            buf.put_u8(TAG_INPUT_ACK);
            buf.put_u32_le(frame.as_i32() as u32);
            buf
        }
        Message::QualityReport { frame, advantage } => {
            let mut buf = Vec::with_capacity(9);
            buf.put_u8(TAG_QUALITY_REPORT);
            buf.put_u32_le(frame.as_i32() as u32);
            buf.put_i32_le(*advantage);
            buf
        }
        Message::QualityReply { frame } => {
            let mut buf = Vec::with_capacity(5);
            buf.put_u8(TAG_QUALITY_REPLY);
            buf.put_u32_le(frame.as_i32() as u32);
            buf
        }
    }
}

/// Decodes a single datagram.
///
/// # Errors
/// Returns a [`DecodeError`] describing the first structural problem found.
pub fn decode(datagram: &[u8]) -> Result<Message, DecodeError> {
    let mut buf = datagram;
    if !buf.has_remaining() {
        return Err(DecodeError::Empty);
    }
    let tag = buf.get_u8();
    match tag {
        TAG_SYNC_REQUEST => Ok(Message::SyncRequest {
            nonce: read_u32(&mut buf)?,
        }),
        TAG_SYNC_REPLY => Ok(Message::SyncReply {
            nonce: read_u32(&mut buf)?,
        }),
        TAG_INPUT_BATCH => {
            need(&buf, 10)?;
            let start = buf.get_u32_le();
            let end = buf.get_u32_le();
            let declared = buf.get_u16_le() as usize;
            if end < start {
                return Err(DecodeError::BadFrameRange { start, end });
            }
            if buf.remaining() != declared {
                return Err(DecodeError::LengthMismatch {
                    declared,
                    actual: buf.remaining(),
                });
            }
            Ok(Message::InputBatch {
                start_frame: read_frame(start)?,
                end_frame: read_frame(end)?,
                bytes: buf.to_vec(),
            })
        }
        TAG_INPUT_ACK => Ok(Message::InputAck {
            frame: read_frame(read_u32(&mut buf)?)?,
        }),
        TAG_QUALITY_REPORT => {
            need(&buf, 8)?;
            let frame = read_frame(buf.get_u32_le())?;
            let advantage = buf.get_i32_le();
            finish(&buf)?;
            Ok(Message::QualityReport { frame, advantage })
        }
        TAG_QUALITY_REPLY => Ok(Message::QualityReply {
            frame: read_frame(read_u32(&mut buf)?)?,
        }),
        other => Err(DecodeError::UnknownTag(other)),
    }
}

fn need(buf: &&[u8], expected: usize) -> Result<(), DecodeError> {
    if buf.remaining() < expected {
        return Err(DecodeError::Truncated {
            expected,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

/// Reads the single u32 field of a fixed-size message and rejects trailing
/// garbage.
fn read_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    need(buf, 4)?;
    let value = buf.get_u32_le();
    finish(buf)?;
    Ok(value)
}

fn finish(buf: &&[u8]) -> Result<(), DecodeError> {
    if buf.has_remaining() {
        return Err(DecodeError::LengthMismatch {
            declared: 0,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn read_frame(value: u32) -> Result<Frame, DecodeError> {
    if value > i32::MAX as u32 {
        return Err(DecodeError::FrameOutOfRange(value));
    }
    Ok(Frame::new(value as i32))
}

// #########
// # TESTS #
// #########


#[cfg(test)]
mod codec_properties {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Decoding arbitrary junk never panics; it either yields a message
        /// or a structured error.
        #[test]
        fn decode_is_total(datagram in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode(&datagram);
        }
    }
}
