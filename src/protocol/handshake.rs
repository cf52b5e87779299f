//! Auth handshake
//!
//! The handshake is a liveness and identity check, not a security boundary:
//!
//! ```text
//! Member                                   Broker
//!   |                                        |
//!   |-- Auth_Request (sender = own id) ----->|
//!   |                                        |  supersede, register
//!   |<- Auth_Response (magic ++ region id) --|
//!   |                                        |
//!   |          [Member is Authed]            |
//! ```
//!
//! The first frame on a new connection must be the auth request; anything
//! else rejects the connection without registering it.

use bytes::{Buf, BufMut, BytesMut};

use super::constants::AUTH_MAGIC;
use super::frame::Frame;
use super::message::{MemberId, MessageId};
use crate::error::HandshakeError;

/// Build the request a member sends first
pub fn auth_request(member: MemberId) -> Frame {
    Frame::empty(MessageId::AUTH_REQUEST, member)
}

/// Validate the first frame on a fresh connection and return the member id
pub fn validate_request(frame: &Frame) -> Result<MemberId, HandshakeError> {
    if frame.message_id != MessageId::AUTH_REQUEST {
        return Err(HandshakeError::UnexpectedFirstMessage(frame.message_id.0));
    }
    if !frame.sender_id.is_valid_member() {
        return Err(HandshakeError::InvalidMemberId(frame.sender_id.0));
    }
    Ok(frame.sender_id)
}

/// Body of the broker's reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthResponse {
    /// Identifier the member uses to attach the shared region
    pub region_id: u32,
}

impl AuthResponse {
    const LEN: usize = 8;

    pub fn to_frame(&self) -> Frame {
        let mut buf = BytesMut::with_capacity(Self::LEN);
        buf.put_u32_le(AUTH_MAGIC);
        buf.put_u32_le(self.region_id);
        Frame {
            message_id: MessageId::AUTH_RESPONSE,
            sender_id: MemberId::BROKER,
            counter: 0,
            payload: buf.freeze(),
        }
    }

    /// Parse the broker's reply as seen by a member
    pub fn from_frame(frame: &Frame) -> Result<Self, HandshakeError> {
        if frame.message_id != MessageId::AUTH_RESPONSE {
            return Err(HandshakeError::UnexpectedFirstMessage(frame.message_id.0));
        }
        if frame.payload.len() != Self::LEN {
            return Err(HandshakeError::MalformedResponse(frame.payload.len()));
        }
        let mut payload = &frame.payload[..];
        let magic = payload.get_u32_le();
        if magic != AUTH_MAGIC {
            return Err(HandshakeError::BadMagic(magic));
        }
        Ok(Self {
            region_id: payload.get_u32_le(),
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_valid_request() {
        let request = auth_request(MemberId::CONTROL);
        assert_eq!(validate_request(&request), Ok(MemberId::CONTROL));
    }

    #[test]
    fn test_wrong_first_message() {
        let ping = Frame::empty(MessageId::PING, MemberId(3));
        assert_eq!(
            validate_request(&ping),
            Err(HandshakeError::UnexpectedFirstMessage(MessageId::PING.0))
        );
    }

    #[test]
    fn test_zero_sender_rejected() {
        let request = auth_request(MemberId::BROKER);
        assert_eq!(
            validate_request(&request),
            Err(HandshakeError::InvalidMemberId(0))
        );
    }

    #[test]
    fn test_sender_outside_bitmask_rejected() {
        let request = auth_request(MemberId(16));
        assert_eq!(
            validate_request(&request),
            Err(HandshakeError::InvalidMemberId(16))
        );
    }

    #[test]
    fn test_response_layout() {
        let frame = AuthResponse { region_id: 0xCAFE }.to_frame();

        assert_eq!(frame.sender_id, MemberId::BROKER);
        assert_eq!(&frame.payload[..4], &AUTH_MAGIC.to_le_bytes());
        assert_eq!(
            AuthResponse::from_frame(&frame),
            Ok(AuthResponse { region_id: 0xCAFE })
        );
    }

    #[test]
    fn test_response_bad_magic() {
        let mut frame = AuthResponse { region_id: 1 }.to_frame();
        frame.payload = Bytes::from_static(&[0, 0, 0, 0, 1, 0, 0, 0]);

        assert_eq!(
            AuthResponse::from_frame(&frame),
            Err(HandshakeError::BadMagic(0))
        );
    }

    #[test]
    fn test_response_wrong_length() {
        let mut frame = AuthResponse { region_id: 1 }.to_frame();
        frame.payload = Bytes::from_static(&[1, 2, 3]);

        assert_eq!(
            AuthResponse::from_frame(&frame),
            Err(HandshakeError::MalformedResponse(3))
        );
    }
}
