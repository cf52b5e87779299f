//! Member connection to the broker
//!
//! High-level API for a process taking part in the bus.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::buffer::ByteBuffer;
use crate::error::{Error, HandshakeError, ProtocolError, Result};
use crate::protocol::handshake::{self, AuthResponse};
use crate::protocol::message::{encode_flags, encode_ids};
use crate::protocol::{Frame, FrameHeader, MemberId, MessageId, HEADER_SIZE, MAX_PAYLOAD_LEN};
use crate::shm::{SharedRegion, SlotAnnouncement, SlotKind};

use super::config::ClientConfig;

/// Authenticated member connection
///
/// # Example
/// ```no_run
/// use membus::client::{ClientConfig, MemberClient};
/// use membus::protocol::{MemberId, MessageId};
///
/// # async fn example() -> membus::error::Result<()> {
/// let config = ClientConfig::new(MemberId::DASHBOARD).socket_path("/tmp/membus.sock");
/// let mut client = MemberClient::connect(config).await?;
///
/// client.subscribe(&[MessageId::PING]).await?;
/// client.send(MessageId::PING, &b"hello"[..]).await?;
/// let frame = client.recv().await?;
/// println!("{} from {}", frame.message_id, frame.sender_id);
/// # Ok(())
/// # }
/// ```
pub struct MemberClient<S = UnixStream> {
    stream: S,
    config: ClientConfig,
    region_id: u32,
    send_buf: ByteBuffer,
    read_buf: BytesMut,
    send_counter: u8,
    recv_counter: u8,
}

impl MemberClient<UnixStream> {
    /// Connect to the broker and authenticate
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let stream = timeout(config.connect_timeout, UnixStream::connect(&config.socket_path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
        Self::handshake(stream, config).await
    }

    /// Map the shared region announced by the broker
    pub fn attach_region(&self) -> Result<SharedRegion> {
        SharedRegion::attach(&self.config.shm_dir, self.region_id)
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> MemberClient<S> {
    /// Authenticate over an already connected stream
    pub async fn handshake(stream: S, config: ClientConfig) -> Result<Self> {
        if !config.member_id.is_valid_member() {
            return Err(HandshakeError::InvalidMemberId(config.member_id.0).into());
        }

        let mut client = Self {
            stream,
            region_id: 0,
            send_buf: ByteBuffer::with_capacity(4096, HEADER_SIZE + MAX_PAYLOAD_LEN),
            read_buf: BytesMut::with_capacity(4096),
            send_counter: 0,
            recv_counter: 0,
            config,
        };

        client
            .send_frame(&handshake::auth_request(client.config.member_id))
            .await?;
        let reply = timeout(client.config.auth_timeout, client.recv())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "auth response timed out"))??;
        client.region_id = AuthResponse::from_frame(&reply)?.region_id;

        tracing::debug!(
            member = %client.config.member_id,
            region_id = client.region_id,
            "Authenticated with broker"
        );
        Ok(client)
    }

    pub fn member_id(&self) -> MemberId {
        self.config.member_id
    }

    /// Shared region id from the auth response
    pub fn region_id(&self) -> u32 {
        self.region_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn send_counter(&self) -> u8 {
        self.send_counter
    }

    pub fn recv_counter(&self) -> u8 {
        self.recv_counter
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Send a frame from this member
    pub async fn send(&mut self, message_id: MessageId, payload: impl Into<Bytes>) -> Result<()> {
        let frame = Frame::new(message_id, self.config.member_id, payload)?;
        self.send_frame(&frame).await
    }

    /// Write one frame; the send counter advances once it is fully written
    pub async fn send_frame(&mut self, frame: &Frame) -> Result<()> {
        frame.encode_into(self.send_counter, &mut self.send_buf)?;
        self.stream.write_all(self.send_buf.as_slice()).await?;
        self.stream.flush().await?;
        self.send_counter = self.send_counter.wrapping_add(1);
        Ok(())
    }

    /// Receive the next frame.
    ///
    /// Cancel safe: bytes read before cancellation stay buffered.
    pub async fn recv(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.parse_frame()? {
                return Ok(frame);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::Disconnected);
            }
        }
    }

    fn parse_frame(&mut self) -> Result<Option<Frame>> {
        if self.read_buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&self.read_buf[..HEADER_SIZE]);
        let header = FrameHeader::decode(&raw);
        header.validate(self.config.max_payload)?;
        if header.counter != self.recv_counter {
            return Err(ProtocolError::CounterMismatch {
                expected: self.recv_counter,
                received: header.counter,
            }
            .into());
        }

        let total = HEADER_SIZE + header.payload_len;
        if self.read_buf.len() < total {
            self.read_buf.reserve(total - self.read_buf.len());
            return Ok(None);
        }

        self.read_buf.advance(HEADER_SIZE);
        let payload = self.read_buf.split_to(header.payload_len).freeze();
        self.recv_counter = self.recv_counter.wrapping_add(1);
        Ok(Some(Frame::from_parts(header, payload)))
    }

    /// Ask the broker to route `ids` to this member
    pub async fn subscribe(&mut self, ids: &[MessageId]) -> Result<()> {
        self.send(MessageId::SUBSCRIBE_TO_MESSAGES, encode_ids(ids))
            .await
    }

    /// Set or clear the deaf flag of other members
    pub async fn deafen(&mut self, flags: &[(MemberId, bool)]) -> Result<()> {
        self.send(MessageId::DEAFEN_MEMBER, encode_flags(flags))
            .await
    }

    /// Set or clear the mute flag of other members
    pub async fn mute(&mut self, flags: &[(MemberId, bool)]) -> Result<()> {
        self.send(MessageId::MUTE_MEMBER, encode_flags(flags)).await
    }

    /// Ask the broker to broadcast its timing sites
    pub async fn request_timing_sites(&mut self) -> Result<()> {
        self.send(MessageId::REQUEST_TIMING_SITES, Bytes::new())
            .await
    }

    /// Write `data` into the next slot of `kind` and announce it
    pub async fn publish_slot(
        &mut self,
        region: &SharedRegion,
        kind: SlotKind,
        data: &[u8],
    ) -> Result<SlotAnnouncement> {
        let announcement = region.write_slot(kind, data)?;
        self.send(kind.message_id(), announcement.encode()).await?;
        Ok(announcement)
    }

    /// Leave the bus gracefully
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(MessageId::DISCONNECT_ME, Bytes::new()).await?;
        self.stream.shutdown().await?;
        tracing::debug!(member = %self.config.member_id, "Disconnected from broker");
        Ok(())
    }
}

impl<S> std::fmt::Debug for MemberClient<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemberClient")
            .field("member_id", &self.config.member_id)
            .field("region_id", &self.region_id)
            .field("send_counter", &self.send_counter)
            .field("recv_counter", &self.recv_counter)
            .finish_non_exhaustive()
    }
}
