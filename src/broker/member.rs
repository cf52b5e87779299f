//! Per-member broker state

use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use crate::connection::Connection;
use crate::protocol::MemberId;
use crate::stats::MemberStats;

/// Why a member left the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Member sent `Disconnect_Me`
    Requested,
    /// Peer closed the socket
    Closed,
    /// A newer connection authenticated with the same id
    Superseded,
    /// Read or write failed
    Fault,
}

/// An authenticated member, owned by the broker's member table
#[derive(Debug)]
pub struct MemberRecord {
    pub id: MemberId,

    pub connection: Connection<UnixStream>,

    /// Frames addressed to this member are not delivered
    pub deaf: bool,

    /// Frames sent by this member are dropped
    pub mute: bool,

    pub stats: MemberStats,

    pub connected_at: Instant,

    /// Last frame received from the member
    pub last_active: Instant,
}

impl MemberRecord {
    pub fn new(id: MemberId, connection: Connection<UnixStream>) -> Self {
        let now = Instant::now();
        Self {
            id,
            connection,
            deaf: false,
            mute: false,
            stats: MemberStats::new(),
            connected_at: now,
            last_active: now,
        }
    }

    /// Account a frame read from this member
    pub fn record_received(&mut self, bytes: usize) {
        self.stats.packets_received += 1;
        self.stats.bytes_received += bytes as u64;
        self.last_active = Instant::now();
    }

    /// Account a frame delivered to this member
    pub fn record_sent(&mut self, bytes: usize) {
        self.stats.packets_sent += 1;
        self.stats.bytes_sent += bytes as u64;
    }

    pub fn record_dropped(&mut self) {
        self.stats.dropped += 1;
    }

    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }
}
