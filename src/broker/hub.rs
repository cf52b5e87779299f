//! Broker main loop
//!
//! One thread owns the listening socket, the member table, the subscription
//! table and the shared region. Each [`Broker::step`] is one iteration:
//!
//! 1. verify the canary guard words (fatal on mismatch)
//! 2. wait in the multiplexer
//! 3. accept and authenticate new members
//! 4. drain complete frames from readable members and dispatch them
//! 5. broadcast `Broker_Stats` once the interval has elapsed

use std::collections::HashMap;
use std::io;
use std::net::Shutdown;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};

use super::config::BrokerConfig;
use super::member::{DisconnectReason, MemberRecord};
use super::subscriptions::SubscriptionTable;
use crate::connection::{Connection, SendMode, SendOutcome};
use crate::error::{Error, Result};
use crate::mux::{Multiplexer, MuxWaker};
use crate::protocol::handshake::{self, AuthResponse};
use crate::protocol::{ControlMessage, Frame, MemberId, MemberListEvent, MessageId};
use crate::shm::{CanarySet, SharedRegion};
use crate::stats::{BrokerStats, SiteId, TimingRegistry};

/// Wait used by `run_until` when no poll timeout is configured
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

struct Sites {
    canary_check: SiteId,
    wait: SiteId,
    accept: SiteId,
    dispatch: SiteId,
    stats: SiteId,
}

impl Sites {
    fn register(timing: &mut TimingRegistry) -> Self {
        Self {
            canary_check: timing.site("canary_check"),
            wait: timing.site("wait"),
            accept: timing.site("accept"),
            dispatch: timing.site("dispatch"),
            stats: timing.site("stats"),
        }
    }
}

/// The hub every member connects to
pub struct Broker {
    config: BrokerConfig,
    listener: UnixListener,
    mux: Multiplexer,
    members: HashMap<MemberId, MemberRecord>,
    by_fd: HashMap<RawFd, MemberId>,
    subscriptions: SubscriptionTable,
    region: SharedRegion,
    canaries: CanarySet,
    stats: BrokerStats,
    timing: TimingRegistry,
    sites: Sites,
    /// Every successful fan-out send, in send order
    #[cfg(test)]
    delivered: Vec<(MessageId, MemberId)>,
}

impl Broker {
    /// Create the shared region and start listening.
    ///
    /// A stale socket file at the configured path is removed first.
    pub fn bind(config: BrokerConfig) -> Result<Self> {
        let region_id = config.region_id.unwrap_or_else(|| fastrand::u32(..));
        let region = SharedRegion::create(&config.shm_dir, region_id, config.layout)?;
        let canaries = CanarySet::install(&region);

        remove_stale_socket(&config.socket_path)?;
        let listener = UnixListener::bind(&config.socket_path)?;
        listener.set_nonblocking(true)?;

        let mut mux = Multiplexer::new()?;
        mux.watch(&listener)?;

        let mut timing = TimingRegistry::new();
        let sites = Sites::register(&mut timing);

        tracing::info!(
            socket = %config.socket_path.display(),
            region = %region.path().display(),
            "Broker listening"
        );

        Ok(Self {
            stats: BrokerStats::new(config.stats_interval),
            config,
            listener,
            mux,
            members: HashMap::new(),
            by_fd: HashMap::new(),
            subscriptions: SubscriptionTable::new(),
            region,
            canaries,
            timing,
            sites,
            #[cfg(test)]
            delivered: Vec::new(),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn region_id(&self) -> u32 {
        self.region.id()
    }

    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    pub fn canaries(&self) -> &CanarySet {
        &self.canaries
    }

    pub fn stats(&self) -> &BrokerStats {
        &self.stats
    }

    pub fn timing(&self) -> &TimingRegistry {
        &self.timing
    }

    pub fn subscriptions(&self) -> &SubscriptionTable {
        &self.subscriptions
    }

    pub fn member(&self, id: MemberId) -> Option<&MemberRecord> {
        self.members.get(&id)
    }

    pub fn is_member(&self, id: MemberId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Ids of the authenticated members
    pub fn members(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.members.keys().copied()
    }

    /// Handle that interrupts a blocked wait, e.g. from a signal thread
    pub fn waker(&self) -> MuxWaker {
        self.mux.waker()
    }

    /// Run until a fatal error
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.step(self.config.poll_timeout)?;
        }
    }

    /// Run until `stop` returns true or a fatal error occurs
    pub fn run_until<F: FnMut() -> bool>(&mut self, mut stop: F) -> Result<()> {
        let timeout = Some(self.config.poll_timeout.unwrap_or(STOP_CHECK_INTERVAL));
        while !stop() {
            self.step(timeout)?;
        }
        tracing::info!(
            members = self.members.len(),
            packets_in = self.stats.total_packets_in,
            packets_out = self.stats.total_packets_out,
            uptime_ms = self.stats.uptime().as_millis() as u64,
            "Broker stopping"
        );
        Ok(())
    }

    /// One loop iteration; `timeout` bounds the multiplexer wait
    pub fn step(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.check_canaries()?;

        let started = self.timing.start();
        let ready = self.mux.wait(timeout)?;
        self.timing.finish(self.sites.wait, started);

        let listener_fd = self.listener.as_raw_fd();
        for fd in ready {
            if fd == listener_fd {
                self.accept_pending()?;
            } else if let Some(member) = self.by_fd.get(&fd).copied() {
                self.service_member(member)?;
            }
        }

        self.emit_stats_if_due();
        Ok(())
    }

    fn check_canaries(&mut self) -> Result<()> {
        let started = self.timing.start();
        let result = self.canaries.verify(&self.region);
        self.timing.finish(self.sites.canary_check, started);

        if let Err(e) = &result {
            tracing::error!(error = %e, "Shared region corrupted");
        }
        result
    }

    fn accept_pending(&mut self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    let started = self.timing.start();
                    self.admit(stream)?;
                    self.timing.finish(self.sites.accept, started);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                    return Ok(());
                }
            }
        }
    }

    /// Authenticate a fresh connection and register it.
    ///
    /// Only multiplexer failures are returned; a misbehaving peer is logged
    /// and dropped.
    fn admit(&mut self, stream: UnixStream) -> Result<()> {
        let mut connection = Connection::with_max_payload(stream, self.config.max_payload);
        let member = match self.authenticate(&mut connection) {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(error = %e, "Auth rejected");
                return Ok(());
            }
        };

        if self.members.contains_key(&member) {
            tracing::info!(member = %member, "Superseding previous connection");
            self.disconnect(member, DisconnectReason::Superseded);
        }

        let reply = AuthResponse {
            region_id: self.region.id(),
        }
        .to_frame();
        let replied = connection
            .send_frame(&reply, SendMode::Blocking)
            .and_then(|_| connection.set_nonblocking(true));
        if let Err(e) = replied {
            tracing::warn!(member = %member, error = %e, "Failed to send auth response");
            return Ok(());
        }

        self.mux.watch(&connection)?;
        self.region.set_online(member, true)?;
        let fd = connection.as_raw_fd();
        self.by_fd.insert(fd, member);
        self.members
            .insert(member, MemberRecord::new(member, connection));
        self.stats.total_connections += 1;

        tracing::info!(member = %member, fd = fd, "Member authenticated");
        self.broadcast_membership(member, true);
        Ok(())
    }

    fn authenticate(&self, connection: &mut Connection) -> Result<MemberId> {
        connection.set_nonblocking(false)?;
        connection.set_read_timeout(self.config.handshake_timeout)?;
        connection.set_write_timeout(self.config.write_timeout)?;

        let request = connection.recv_frame_blocking()?;
        let member = handshake::validate_request(&request)?;
        connection.set_read_timeout(None)?;
        Ok(member)
    }

    /// Drain complete frames from one member, up to the per-wake budget
    fn service_member(&mut self, member: MemberId) -> Result<()> {
        for _ in 0..self.config.max_frames_per_wake {
            let Some(record) = self.members.get_mut(&member) else {
                return Ok(());
            };
            let frame = match record.connection.recv_frame() {
                Ok(Some(frame)) => {
                    record.record_received(frame.wire_len());
                    frame
                }
                Ok(None) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    tracing::error!(member = %member, error = %e, "Stream desynchronized");
                    return Err(e);
                }
                Err(Error::Disconnected) => {
                    self.disconnect(member, DisconnectReason::Closed);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(member = %member, error = %e, "Read failed");
                    self.disconnect(member, DisconnectReason::Fault);
                    return Ok(());
                }
            };

            self.stats.record_in(frame.wire_len());
            self.dispatch(member, frame);
        }
        Ok(())
    }

    fn dispatch(&mut self, sender: MemberId, frame: Frame) {
        let started = self.timing.start();
        match ControlMessage::parse(&frame) {
            Ok(None) => self.distribute(sender, &frame),
            Ok(Some(control)) => self.apply_control(sender, control, &frame),
            Err(e) => {
                tracing::warn!(member = %sender, error = %e, "Dropping malformed control frame")
            }
        }
        self.timing.finish(self.sites.dispatch, started);
    }

    fn apply_control(&mut self, sender: MemberId, control: ControlMessage, frame: &Frame) {
        match control {
            ControlMessage::Subscribe(ids) => {
                for id in ids {
                    if self.subscriptions.subscribe(id, sender) {
                        tracing::debug!(member = %sender, message = %id, "Subscribed");
                    }
                }
            }
            ControlMessage::Deafen(flags) => {
                self.set_flags(sender, &flags, "deaf", |record, on| record.deaf = on)
            }
            ControlMessage::Mute(flags) => {
                self.set_flags(sender, &flags, "mute", |record, on| record.mute = on)
            }
            ControlMessage::RequestTimingSites => {
                self.distribute(sender, frame);
                let reply = Frame {
                    message_id: MessageId::TIMING_SITES,
                    sender_id: MemberId::BROKER,
                    counter: 0,
                    payload: self.timing.encode(),
                };
                self.distribute(MemberId::BROKER, &reply);
            }
            ControlMessage::DisconnectMe => self.disconnect(sender, DisconnectReason::Requested),
        }
    }

    fn set_flags(
        &mut self,
        sender: MemberId,
        flags: &[(MemberId, bool)],
        flag: &'static str,
        apply: fn(&mut MemberRecord, bool),
    ) {
        for &(target, on) in flags {
            match self.members.get_mut(&target) {
                Some(record) => {
                    apply(record, on);
                    tracing::debug!(member = %sender, subject = %target, flag, on, "Flag updated");
                }
                None => {
                    tracing::debug!(member = %sender, subject = %target, flag, "Flag target not connected")
                }
            }
        }
    }

    /// Send `frame` to every audible subscriber of its message id
    fn distribute(&mut self, origin: MemberId, frame: &Frame) {
        if self.members.get(&origin).is_some_and(|record| record.mute) {
            tracing::trace!(member = %origin, message = %frame.message_id, "Muted, frame dropped");
            return;
        }

        let mut failed = Vec::new();
        for target in self.subscriptions.snapshot(frame.message_id) {
            let Some(record) = self.members.get_mut(&target) else {
                continue;
            };
            if record.deaf {
                continue;
            }
            match record.connection.send_frame(frame, SendMode::NonBlocking) {
                Ok(SendOutcome::Sent(bytes)) => {
                    record.record_sent(bytes);
                    self.stats.record_out(bytes);
                    #[cfg(test)]
                    self.delivered.push((frame.message_id, target));
                }
                Ok(SendOutcome::WouldBlock) => {
                    record.record_dropped();
                    self.stats.record_drop();
                    tracing::debug!(member = %target, message = %frame.message_id, "Dropped packet");
                }
                Err(e) => {
                    tracing::warn!(member = %target, error = %e, "Send failed");
                    failed.push(target);
                }
            }
        }

        for target in failed {
            self.disconnect(target, DisconnectReason::Fault);
        }
    }

    /// Remove a member everywhere and tell the others
    fn disconnect(&mut self, member: MemberId, reason: DisconnectReason) {
        let Some(record) = self.members.remove(&member) else {
            return;
        };
        self.by_fd.remove(&record.connection.as_raw_fd());
        if let Err(e) = self.mux.unwatch(record.connection.get_ref()) {
            tracing::warn!(member = %member, error = %e, "Failed to unwatch member");
        }
        let _ = record.connection.get_ref().shutdown(Shutdown::Both);

        let purged = self.subscriptions.remove_member(member);
        if let Err(e) = self.region.set_online(member, false) {
            tracing::warn!(member = %member, error = %e, "Failed to clear online bit");
        }

        tracing::info!(
            member = %member,
            reason = ?reason,
            subscriptions = purged,
            packets_in = record.stats.packets_received,
            packets_out = record.stats.packets_sent,
            dropped = record.stats.dropped,
            uptime_ms = record.connected_for().as_millis() as u64,
            idle_ms = record.idle_for().as_millis() as u64,
            "Member disconnected"
        );
        drop(record);

        self.broadcast_membership(member, false);
    }

    fn broadcast_membership(&mut self, member: MemberId, online: bool) {
        let frame = Frame {
            message_id: MessageId::MEMBER_LIST,
            sender_id: MemberId::BROKER,
            counter: 0,
            payload: MemberListEvent { member, online }.encode(),
        };
        self.distribute(MemberId::BROKER, &frame);
    }

    fn emit_stats_if_due(&mut self) {
        let Some(sample) = self.stats.take_sample(Instant::now()) else {
            return;
        };
        let started = self.timing.start();
        tracing::debug!(
            packets_in = sample.packets_in_per_sec,
            bytes_in = sample.bytes_in_per_sec,
            packets_out = sample.packets_out_per_sec,
            bytes_out = sample.bytes_out_per_sec,
            "Broker throughput"
        );

        let frame = Frame {
            message_id: MessageId::BROKER_STATS,
            sender_id: MemberId::BROKER,
            counter: 0,
            payload: sample.encode(),
        };
        // The stats broadcast is not part of the throughput it reports
        self.stats.set_accounting(false);
        self.distribute(MemberId::BROKER, &frame);
        self.stats.set_accounting(true);
        self.timing.finish(self.sites.stats, started);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.config.socket_path);
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("socket_path", &self.config.socket_path)
            .field("region", &self.region)
            .field("members", &self.members.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "Removed stale socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
