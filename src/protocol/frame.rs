//! Frame type and codec
//!
//! Encoding is clear-and-append: the header is written first because the
//! payload length is known up front, then the payload follows. Decoding is
//! two-phase: header, length check, then exactly that many payload bytes.

use bytes::Bytes;

use super::constants::{HEADER_SIZE, MAX_PAYLOAD_LEN};
use super::header::FrameHeader;
use super::message::{MemberId, MessageId};
use crate::buffer::ByteBuffer;
use crate::error::{ProtocolError, Result};

/// One framed message
///
/// Cheap to clone; the payload is reference counted so fan-out never copies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: MessageId,
    pub sender_id: MemberId,
    /// Rolling counter as seen on the wire; assigned by the sending connection
    pub counter: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame, rejecting payloads that do not fit 24 bits
    pub fn new(
        message_id: MessageId,
        sender_id: MemberId,
        payload: impl Into<Bytes>,
    ) -> std::result::Result<Self, ProtocolError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(Self {
            message_id,
            sender_id,
            counter: 0,
            payload,
        })
    }

    /// Frame with no payload
    pub fn empty(message_id: MessageId, sender_id: MemberId) -> Self {
        Self {
            message_id,
            sender_id,
            counter: 0,
            payload: Bytes::new(),
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            message_id: self.message_id,
            sender_id: self.sender_id,
            counter: self.counter,
            payload_len: self.payload.len(),
        }
    }

    /// Bytes this frame occupies on the wire
    pub fn wire_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Clear `buf` and write header + payload using `counter`
    pub fn encode_into(&self, counter: u8, buf: &mut ByteBuffer) -> Result<()> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLarge {
                len: self.payload.len(),
                max: MAX_PAYLOAD_LEN,
            }
            .into());
        }
        buf.clear();
        FrameHeader {
            counter,
            ..self.header()
        }
        .encode(buf)?;
        buf.put_slice(&self.payload)?;
        Ok(())
    }

    /// Decode one frame from the read cursor of `buf`
    pub fn decode(buf: &mut ByteBuffer, max_payload: usize) -> Result<Self> {
        let mut raw = [0u8; HEADER_SIZE];
        buf.copy_to_slice(&mut raw)?;
        let header = FrameHeader::decode(&raw);
        header.validate(max_payload.min(MAX_PAYLOAD_LEN))?;

        let payload = Bytes::copy_from_slice(buf.get_slice(header.payload_len)?);
        Ok(Self::from_parts(header, payload))
    }

    pub(crate) fn from_parts(header: FrameHeader, payload: Bytes) -> Self {
        Self {
            message_id: header.message_id,
            sender_id: header.sender_id,
            counter: header.counter,
            payload,
        }
    }
}
