//! Statistics for members and broker throughput

use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::MessageId;

/// Per-member counters kept by the broker
#[derive(Debug, Clone, Default)]
pub struct MemberStats {
    /// Frames the member sent to the broker
    pub packets_received: u64,
    /// Frames the broker delivered to the member
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Frames dropped because the member's socket was full
    pub dropped: u64,
}

impl MemberStats {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rates carried by a `Broker_Stats` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateSample {
    pub packets_in_per_sec: u32,
    pub bytes_in_per_sec: u32,
    pub packets_out_per_sec: u32,
    pub bytes_out_per_sec: u32,
}

impl RateSample {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        buf.put_u32_le(self.packets_in_per_sec);
        buf.put_u32_le(self.bytes_in_per_sec);
        buf.put_u32_le(self.packets_out_per_sec);
        buf.put_u32_le(self.bytes_out_per_sec);
        buf.freeze()
    }

    pub fn decode(mut payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() != Self::ENCODED_LEN {
            return Err(ProtocolError::MalformedPayload {
                message_id: MessageId::BROKER_STATS.0,
                reason: "expected 16 bytes",
            });
        }
        Ok(Self {
            packets_in_per_sec: payload.get_u32_le(),
            bytes_in_per_sec: payload.get_u32_le(),
            packets_out_per_sec: payload.get_u32_le(),
            bytes_out_per_sec: payload.get_u32_le(),
        })
    }
}

/// Broker-wide packet and byte accounting
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Totals since startup
    pub total_packets_in: u64,
    pub total_bytes_in: u64,
    pub total_packets_out: u64,
    pub total_bytes_out: u64,
    pub total_dropped: u64,
    pub total_connections: u64,
    window: [u64; 4],
    window_start: Instant,
    interval: Duration,
    accounting: bool,
    started_at: Instant,
}

impl BrokerStats {
    pub fn new(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            total_packets_in: 0,
            total_bytes_in: 0,
            total_packets_out: 0,
            total_bytes_out: 0,
            total_dropped: 0,
            total_connections: 0,
            window: [0; 4],
            window_start: now,
            interval,
            accounting: true,
            started_at: now,
        }
    }

    /// Frame read from a member
    pub fn record_in(&mut self, bytes: usize) {
        if !self.accounting {
            return;
        }
        self.total_packets_in += 1;
        self.total_bytes_in += bytes as u64;
        self.window[0] += 1;
        self.window[1] += bytes as u64;
    }

    /// Frame written to a member
    pub fn record_out(&mut self, bytes: usize) {
        if !self.accounting {
            return;
        }
        self.total_packets_out += 1;
        self.total_bytes_out += bytes as u64;
        self.window[2] += 1;
        self.window[3] += bytes as u64;
    }

    pub fn record_drop(&mut self) {
        self.total_dropped += 1;
    }

    /// Suspend or resume accounting; the stats broadcast itself is not counted
    pub fn set_accounting(&mut self, enabled: bool) {
        self.accounting = enabled;
    }

    pub fn is_accounting(&self) -> bool {
        self.accounting
    }

    /// Close the current window if `interval` has passed and return its rates
    pub fn take_sample(&mut self, now: Instant) -> Option<RateSample> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval || elapsed.is_zero() {
            return None;
        }
        let secs = elapsed.as_secs_f64();
        let rate = |v: u64| (v as f64 / secs).round().min(u32::MAX as f64) as u32;
        let sample = RateSample {
            packets_in_per_sec: rate(self.window[0]),
            bytes_in_per_sec: rate(self.window[1]),
            packets_out_per_sec: rate(self.window[2]),
            bytes_out_per_sec: rate(self.window[3]),
        };
        self.window = [0; 4];
        self.window_start = now;
        Some(sample)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_stats_new() {
        let stats = MemberStats::new();
        assert_eq!(stats.packets_received, 0);
        assert_eq!(stats.packets_sent, 0);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_sample_not_ready_before_interval() {
        let mut stats = BrokerStats::new(Duration::from_secs(1));
        stats.record_in(100);
        let start = stats.window_start;

        assert!(stats.take_sample(start + Duration::from_millis(500)).is_none());
    }

    #[test]
    fn test_sample_rates_per_second() {
        let mut stats = BrokerStats::new(Duration::from_secs(1));
        let start = stats.window_start;
        for _ in 0..10 {
            stats.record_in(100);
        }
        for _ in 0..20 {
            stats.record_out(50);
        }

        let sample = stats.take_sample(start + Duration::from_secs(2)).unwrap();
        assert_eq!(
            sample,
            RateSample {
                packets_in_per_sec: 5,
                bytes_in_per_sec: 500,
                packets_out_per_sec: 10,
                bytes_out_per_sec: 500,
            }
        );

        // Window was reset, totals were not
        let next = stats.take_sample(start + Duration::from_secs(3)).unwrap();
        assert_eq!(next, RateSample::default());
        assert_eq!(stats.total_packets_in, 10);
        assert_eq!(stats.total_bytes_out, 1000);
    }

    #[test]
    fn test_uptime_counts_from_creation() {
        let mut stats = BrokerStats::new(Duration::from_secs(1));
        assert!(stats.uptime() < Duration::from_secs(60));

        stats.started_at -= Duration::from_secs(90);
        assert!(stats.uptime() >= Duration::from_secs(90));
    }

    #[test]
    fn test_accounting_suspended() {
        let mut stats = BrokerStats::new(Duration::from_secs(1));
        stats.set_accounting(false);
        stats.record_out(1000);
        stats.record_in(1000);
        stats.set_accounting(true);

        assert_eq!(stats.total_packets_out, 0);
        assert_eq!(stats.total_packets_in, 0);
        assert!(stats.is_accounting());
    }

    #[test]
    fn test_rate_sample_payload() {
        let sample = RateSample {
            packets_in_per_sec: 1,
            bytes_in_per_sec: 2,
            packets_out_per_sec: 3,
            bytes_out_per_sec: 4,
        };
        let payload = sample.encode();
        assert_eq!(payload.len(), RateSample::ENCODED_LEN);
        assert_eq!(RateSample::decode(&payload).unwrap(), sample);
        assert!(RateSample::decode(&payload[..12]).is_err());
    }
}
