//! Wire protocol
//!
//! Frames, headers, message ids, control payloads and the auth handshake.
//! Nothing in here performs I/O; see [`crate::connection`] for that.

pub mod constants;
pub mod frame;
pub mod handshake;
pub mod header;
pub mod message;

pub use constants::*;
pub use frame::Frame;
pub use handshake::AuthResponse;
pub use header::FrameHeader;
pub use message::{ControlMessage, MemberId, MemberListEvent, MessageId};
