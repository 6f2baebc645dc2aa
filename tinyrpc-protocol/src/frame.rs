//! Message framings.
//!
//! A framing delimits messages on the byte stream; the codec layer puts a
//! header message and a body message on the wire for every call.
//!
//! Binary frame layout (12 bytes header + payload):
//!
//! ```text
//! +---------+-------------+---------+---------------------+
//! | magic   | payload_len | crc32c  | payload             |
//! | 4 bytes | 4 bytes     | 4 bytes | payload_len bytes   |
//! +---------+-------------+---------+---------------------+
//! ```

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes identifying binary frames: "TRPC"
pub const FRAME_MAGIC: [u8; 4] = *b"TRPC";

/// Size of the fixed binary frame header in bytes (4+4+4 = 12).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Delimits messages on a byte stream.
pub trait Framing: Send + Sync {
    /// Appends one framed message carrying `payload` to `dst`.
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError>;

    /// Extracts the next complete message payload from `src`.
    ///
    /// Returns `Ok(None)` if more data is needed.
    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError>;
}

/// Length-prefixed frames with a CRC32C of the payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryFraming;

impl Framing for BinaryFraming {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(FRAME_HEADER_SIZE + payload.len());
        dst.put_slice(&FRAME_MAGIC);
        dst.put_u32(payload.len() as u32);
        dst.put_u32(crc32c::crc32c(payload));
        dst.put_slice(payload);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [src[0], src[1], src[2], src[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic(magic));
        }

        let payload_len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let crc_expected = u32::from_be_bytes([src[8], src[9], src[10], src[11]]);

        let total_len = FRAME_HEADER_SIZE + payload_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let payload = src.split_to(payload_len).freeze();

        let crc_actual = crc32c::crc32c(&payload);
        if crc_actual != crc_expected {
            return Err(ProtocolError::CrcMismatch {
                expected: crc_expected,
                actual: crc_actual,
            });
        }

        Ok(Some(payload))
    }
}

/// Newline-delimited messages. Payloads must be compact JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFraming;

impl Framing for LineFraming {
    fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if payload.contains(&b'\n') {
            return Err(ProtocolError::EmbeddedNewline);
        }
        dst.reserve(payload.len() + 1);
        dst.put_slice(payload);
        dst.put_u8(b'\n');
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        match src.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                let mut line = src.split_to(pos + 1);
                line.truncate(pos);
                Ok(Some(line.freeze()))
            }
            None if src.len() > MAX_PAYLOAD_SIZE => Err(ProtocolError::FrameTooLarge {
                size: src.len(),
                max: MAX_PAYLOAD_SIZE,
            }),
            None => Ok(None),
        }
    }
}
