//! Fixed frame header
//!
//! ```text
//!  0               2               4                               8
//! +---------------+---------------+-------------------------------+
//! |  message_id   |   sender_id   | length << 8 | counter         |
//! |   u16 (LE)    |   u16 (LE)    |          u32 (LE)             |
//! +---------------+---------------+-------------------------------+
//! ```
//!
//! The 8-bit rolling counter and the 24-bit payload length share the last
//! word, which caps payloads at `2^24 - 1` bytes.

use super::constants::{HEADER_SIZE, MAX_PAYLOAD_LEN};
use super::message::{MemberId, MessageId};
use crate::buffer::ByteBuffer;
use crate::error::{BufferError, ProtocolError};

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: MessageId,
    pub sender_id: MemberId,
    pub counter: u8,
    pub payload_len: usize,
}

impl FrameHeader {
    /// Pack counter and length into the shared word
    pub fn counter_and_length(&self) -> u32 {
        ((self.payload_len as u32) << 8) | self.counter as u32
    }

    /// Append the 8 header bytes
    pub fn encode(&self, buf: &mut ByteBuffer) -> Result<(), BufferError> {
        debug_assert!(self.payload_len <= MAX_PAYLOAD_LEN);
        buf.put_u16(self.message_id.0)?;
        buf.put_u16(self.sender_id.0)?;
        buf.put_u32(self.counter_and_length())
    }

    /// Decode from exactly [`HEADER_SIZE`] bytes
    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let message_id = u16::from_le_bytes([raw[0], raw[1]]);
        let sender_id = u16::from_le_bytes([raw[2], raw[3]]);
        let packed = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);

        Self {
            message_id: MessageId(message_id),
            sender_id: MemberId(sender_id),
            counter: (packed & 0xFF) as u8,
            payload_len: (packed >> 8) as usize,
        }
    }

    /// Reject payload lengths above `max`
    pub fn validate(&self, max: usize) -> Result<(), ProtocolError> {
        if self.payload_len > max {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.payload_len,
                max,
            });
        }
        Ok(())
    }
}
