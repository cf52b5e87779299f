//! Error types
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are split
//! into per-member faults, which the broker survives by disconnecting the
//! member, and fatal errors (see [`Error::is_fatal`]) which mean the bus can
//! no longer be trusted.

use std::fmt;
use std::io;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug)]
pub enum Error {
    /// Underlying socket or file error
    Io(io::Error),
    /// Wire protocol violation
    Protocol(ProtocolError),
    /// Byte buffer bounds or capacity violation
    Buffer(BufferError),
    /// Shared region error
    Shm(ShmError),
    /// Auth handshake failure
    Handshake(HandshakeError),
    /// Peer closed the stream
    Disconnected,
    /// A guard word in the shared region no longer holds its reference value
    CanaryViolation {
        offset: usize,
        expected: u64,
        found: u64,
    },
}

impl Error {
    /// Whether this error means the process must stop.
    ///
    /// Counter desync and shared memory corruption are never recovered from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(ProtocolError::CounterMismatch { .. }) | Error::CanaryViolation { .. }
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e),
            Error::Buffer(e) => write!(f, "Buffer error: {}", e),
            Error::Shm(e) => write!(f, "Shared region error: {}", e),
            Error::Handshake(e) => write!(f, "Handshake error: {}", e),
            Error::Disconnected => write!(f, "Peer disconnected"),
            Error::CanaryViolation {
                offset,
                expected,
                found,
            } => write!(
                f,
                "Canary at offset {} corrupted: expected {:#018x}, found {:#018x}",
                offset, expected, found
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Protocol(e) => Some(e),
            Error::Buffer(e) => Some(e),
            Error::Shm(e) => Some(e),
            Error::Handshake(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<BufferError> for Error {
    fn from(e: BufferError) -> Self {
        Error::Buffer(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}

impl From<HandshakeError> for Error {
    fn from(e: HandshakeError) -> Self {
        Error::Handshake(e)
    }
}

/// Wire protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Payload does not fit the 24-bit length field
    PayloadTooLarge { len: usize, max: usize },
    /// Received frame carried an unexpected rolling counter
    CounterMismatch { expected: u8, received: u8 },
    /// The OS accepted part of a frame on a non-blocking send
    PartialWrite { written: usize, expected: usize },
    /// Control payload could not be parsed
    MalformedPayload { message_id: u16, reason: &'static str },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::PayloadTooLarge { len, max } => {
                write!(f, "payload of {} bytes exceeds maximum {}", len, max)
            }
            ProtocolError::CounterMismatch { expected, received } => write!(
                f,
                "frame counter mismatch: expected {}, received {}",
                expected, received
            ),
            ProtocolError::PartialWrite { written, expected } => write!(
                f,
                "partial non-blocking write: {} of {} bytes",
                written, expected
            ),
            ProtocolError::MalformedPayload { message_id, reason } => {
                write!(f, "malformed payload for message {}: {}", message_id, reason)
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Byte buffer errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// Write would grow the buffer past its ceiling
    CapacityExceeded { requested: usize, max: usize },
    /// Read past the written end
    OutOfBounds { position: usize, len: usize, available: usize },
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferError::CapacityExceeded { requested, max } => write!(
                f,
                "buffer would grow to {} bytes, ceiling is {}",
                requested, max
            ),
            BufferError::OutOfBounds {
                position,
                len,
                available,
            } => write!(
                f,
                "read of {} bytes at {} exceeds {} available",
                len, position, available
            ),
        }
    }
}

impl std::error::Error for BufferError {}

/// Shared region errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShmError {
    /// Layout description is unusable
    InvalidLayout(String),
    /// Mapped file does not carry a region header
    BadMagic(u32),
    /// Header version differs from ours
    VersionMismatch { expected: u32, found: u32 },
    /// Mapped file is smaller than its layout requires
    TooSmall { required: usize, actual: usize },
    /// Slot index outside the kind's slot array
    SlotOutOfRange { index: usize, count: usize },
    /// Payload larger than the slot capacity
    PayloadTooLarge { len: usize, capacity: usize },
    /// Announced region does not match a slot
    BadAnnouncement(String),
    /// Nothing has been published for this kind yet
    NothingPublished,
    /// The slot was rewritten while it was being read
    TornRead,
    /// Member id cannot be represented in the online bitmask
    MemberOutOfRange(u16),
}

impl fmt::Display for ShmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmError::InvalidLayout(reason) => write!(f, "invalid layout: {}", reason),
            ShmError::BadMagic(found) => write!(f, "bad region magic {:#010x}", found),
            ShmError::VersionMismatch { expected, found } => write!(
                f,
                "region version mismatch: expected {}, found {}",
                expected, found
            ),
            ShmError::TooSmall { required, actual } => write!(
                f,
                "region is {} bytes, layout requires {}",
                actual, required
            ),
            ShmError::SlotOutOfRange { index, count } => {
                write!(f, "slot {} out of range ({} slots)", index, count)
            }
            ShmError::PayloadTooLarge { len, capacity } => {
                write!(f, "payload of {} bytes exceeds slot capacity {}", len, capacity)
            }
            ShmError::BadAnnouncement(reason) => write!(f, "bad slot announcement: {}", reason),
            ShmError::NothingPublished => write!(f, "nothing published yet"),
            ShmError::TornRead => write!(f, "slot changed while reading"),
            ShmError::MemberOutOfRange(id) => write!(f, "member id {} out of range", id),
        }
    }
}

impl std::error::Error for ShmError {}

/// Auth handshake errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// First frame was not an auth request
    UnexpectedFirstMessage(u16),
    /// Sender id is zero or does not fit the online bitmask
    InvalidMemberId(u16),
    /// Auth response carried the wrong magic constant
    BadMagic(u32),
    /// Auth response payload has the wrong size
    MalformedResponse(usize),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::UnexpectedFirstMessage(id) => {
                write!(f, "expected auth request, got message {}", id)
            }
            HandshakeError::InvalidMemberId(id) => write!(f, "invalid member id {}", id),
            HandshakeError::BadMagic(magic) => write!(f, "bad auth magic {:#010x}", magic),
            HandshakeError::MalformedResponse(len) => {
                write!(f, "auth response payload of {} bytes", len)
            }
        }
    }
}

impl std::error::Error for HandshakeError {}
