//! Message and member identifiers plus control payloads
//!
//! Message ids are opaque to the broker except for the control set below,
//! which [`ControlMessage::parse`] recognizes. Everything else is routed by
//! id alone.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::MAX_MEMBER_ID;
use super::frame::Frame;
use crate::error::ProtocolError;

/// 16-bit message identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u16);

impl MessageId {
    pub const AUTH_REQUEST: MessageId = MessageId(1);
    pub const AUTH_RESPONSE: MessageId = MessageId(2);
    pub const SUBSCRIBE_TO_MESSAGES: MessageId = MessageId(3);
    pub const DEAFEN_MEMBER: MessageId = MessageId(4);
    pub const MUTE_MEMBER: MessageId = MessageId(5);
    pub const DISCONNECT_ME: MessageId = MessageId(6);
    pub const MEMBER_LIST: MessageId = MessageId(7);
    pub const BROKER_STATS: MessageId = MessageId(8);
    pub const REQUEST_TIMING_SITES: MessageId = MessageId(9);
    pub const TIMING_SITES: MessageId = MessageId(10);
    pub const PING: MessageId = MessageId(11);

    /// Announcements pointing into the shared region
    pub const CAMERA_FRAME: MessageId = MessageId(32);
    pub const PROCESSED_BINARY_FRAME: MessageId = MessageId(33);
    pub const TOP_DOWN_FRAME: MessageId = MessageId(34);

    /// Raw wire value
    pub fn value(self) -> u16 {
        self.0
    }

    /// Human-readable name for logs
    pub fn name(self) -> &'static str {
        match self {
            MessageId::AUTH_REQUEST => "Auth_Request",
            MessageId::AUTH_RESPONSE => "Auth_Response",
            MessageId::SUBSCRIBE_TO_MESSAGES => "Subscribe_To_Messages",
            MessageId::DEAFEN_MEMBER => "Deafen_Member",
            MessageId::MUTE_MEMBER => "Mute_Member",
            MessageId::DISCONNECT_ME => "Disconnect_Me",
            MessageId::MEMBER_LIST => "Member_List",
            MessageId::BROKER_STATS => "Broker_Stats",
            MessageId::REQUEST_TIMING_SITES => "Request_Timing_Sites",
            MessageId::TIMING_SITES => "Timing_Sites",
            MessageId::PING => "Ping",
            MessageId::CAMERA_FRAME => "Camera_Frame",
            MessageId::PROCESSED_BINARY_FRAME => "Processed_Binary_Frame",
            MessageId::TOP_DOWN_FRAME => "Top_Down_Frame",
            _ => "Opaque",
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

impl From<u16> for MessageId {
    fn from(v: u16) -> Self {
        MessageId(v)
    }
}

/// 16-bit member identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(pub u16);

impl MemberId {
    /// The broker itself; never valid in an auth request
    pub const BROKER: MemberId = MemberId(0);

    // Members of the robotics stack
    pub const CAMERA_DRIVER: MemberId = MemberId(1);
    pub const CAN_BRIDGE: MemberId = MemberId(2);
    pub const NETWORK_BRIDGE: MemberId = MemberId(3);
    pub const VIDEO_SOURCE: MemberId = MemberId(4);
    pub const CONTROL: MemberId = MemberId(5);
    pub const DASHBOARD: MemberId = MemberId(6);

    pub fn value(self) -> u16 {
        self.0
    }

    /// Whether this id may authenticate as a member
    pub fn is_valid_member(self) -> bool {
        self.0 != 0 && self.0 <= MAX_MEMBER_ID
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for MemberId {
    fn from(v: u16) -> Self {
        MemberId(v)
    }
}

/// Control frames the broker acts on before generic distribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Subscribe(Vec<MessageId>),
    Deafen(Vec<(MemberId, bool)>),
    Mute(Vec<(MemberId, bool)>),
    RequestTimingSites,
    DisconnectMe,
}

impl ControlMessage {
    /// Recognize a control frame.
    ///
    /// Returns `Ok(None)` for ids the broker only routes.
    pub fn parse(frame: &Frame) -> Result<Option<Self>, ProtocolError> {
        let id = frame.message_id;
        let payload = &frame.payload;
        let msg = match id {
            MessageId::SUBSCRIBE_TO_MESSAGES => ControlMessage::Subscribe(decode_ids(id, payload)?),
            MessageId::DEAFEN_MEMBER => ControlMessage::Deafen(decode_flags(id, payload)?),
            MessageId::MUTE_MEMBER => ControlMessage::Mute(decode_flags(id, payload)?),
            MessageId::REQUEST_TIMING_SITES => ControlMessage::RequestTimingSites,
            MessageId::DISCONNECT_ME => ControlMessage::DisconnectMe,
            _ => return Ok(None),
        };
        Ok(Some(msg))
    }
}

/// Payload of a `Subscribe_To_Messages` frame
pub fn encode_ids(ids: &[MessageId]) -> Bytes {
    let mut buf = BytesMut::with_capacity(ids.len() * 2);
    for id in ids {
        buf.put_u16_le(id.0);
    }
    buf.freeze()
}

fn decode_ids(id: MessageId, mut payload: &[u8]) -> Result<Vec<MessageId>, ProtocolError> {
    if payload.len() % 2 != 0 {
        return Err(ProtocolError::MalformedPayload {
            message_id: id.0,
            reason: "id list has odd length",
        });
    }
    let mut ids = Vec::with_capacity(payload.len() / 2);
    while payload.has_remaining() {
        ids.push(MessageId(payload.get_u16_le()));
    }
    Ok(ids)
}

/// Payload of a `Deafen_Member` or `Mute_Member` frame
pub fn encode_flags(flags: &[(MemberId, bool)]) -> Bytes {
    let mut buf = BytesMut::with_capacity(flags.len() * 3);
    for (member, on) in flags {
        buf.put_u16_le(member.0);
        buf.put_u8(*on as u8);
    }
    buf.freeze()
}

fn decode_flags(id: MessageId, mut payload: &[u8]) -> Result<Vec<(MemberId, bool)>, ProtocolError> {
    if payload.len() % 3 != 0 {
        return Err(ProtocolError::MalformedPayload {
            message_id: id.0,
            reason: "flag list is not a multiple of 3 bytes",
        });
    }
    let mut flags = Vec::with_capacity(payload.len() / 3);
    while payload.has_remaining() {
        let member = MemberId(payload.get_u16_le());
        let on = payload.get_u8() != 0;
        flags.push((member, on));
    }
    Ok(flags)
}

/// Membership change broadcast as `Member_List`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberListEvent {
    pub member: MemberId,
    pub online: bool,
}

impl MemberListEvent {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3);
        buf.put_u16_le(self.member.0);
        buf.put_u8(self.online as u8);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != 3 {
            return Err(ProtocolError::MalformedPayload {
                message_id: MessageId::MEMBER_LIST.0,
                reason: "expected 3 bytes",
            });
        }
        Ok(Self {
            member: MemberId(payload.get_u16_le()),
            online: payload.get_u8() != 0,
        })
    }
}
