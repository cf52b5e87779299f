//! Timing sites
//!
//! A [`TimingRegistry`] is owned by whoever measures (the broker owns one)
//! and passed by reference; there is no global registry. Its snapshot is the
//! payload of a `Timing_Sites` frame.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::protocol::MessageId;

/// Handle to a registered site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteId(usize);

/// Accumulated measurements of one site
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingSite {
    pub name: String,
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
}

impl TimingSite {
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(nanos.min(u128::from(u64::MAX)) as u64)
        }
    }
}

#[derive(Debug, Default)]
pub struct TimingRegistry {
    sites: Vec<TimingSite>,
    by_name: HashMap<String, SiteId>,
}

impl TimingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a site, or return the existing one with this name
    pub fn site(&mut self, name: &str) -> SiteId {
        if let Some(id) = self.by_name.get(name) {
            return *id;
        }
        let id = SiteId(self.sites.len());
        self.sites.push(TimingSite {
            name: name.to_string(),
            count: 0,
            total: Duration::ZERO,
            max: Duration::ZERO,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    pub fn record(&mut self, id: SiteId, elapsed: Duration) {
        let site = &mut self.sites[id.0];
        site.count += 1;
        site.total += elapsed;
        site.max = site.max.max(elapsed);
    }

    /// Start measuring; pass the result to [`finish`](Self::finish)
    pub fn start(&self) -> Instant {
        Instant::now()
    }

    pub fn finish(&mut self, id: SiteId, started: Instant) {
        self.record(id, started.elapsed());
    }

    pub fn get(&self, id: SiteId) -> &TimingSite {
        &self.sites[id.0]
    }

    pub fn sites(&self) -> &[TimingSite] {
        &self.sites
    }

    /// `(u8 name_len, name, u64 count, u64 total_ns, u64 max_ns)` per site
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for site in &self.sites {
            let name = &site.name.as_bytes()[..site.name.len().min(u8::MAX as usize)];
            buf.put_u8(name.len() as u8);
            buf.put_slice(name);
            buf.put_u64_le(site.count);
            buf.put_u64_le(site.total.as_nanos().min(u64::MAX as u128) as u64);
            buf.put_u64_le(site.max.as_nanos().min(u64::MAX as u128) as u64);
        }
        buf.freeze()
    }

    /// Parse a `Timing_Sites` payload
    pub fn decode(mut payload: &[u8]) -> Result<Vec<TimingSite>, ProtocolError> {
        let malformed = |reason: &'static str| ProtocolError::MalformedPayload {
            message_id: MessageId::TIMING_SITES.0,
            reason,
        };
        let mut sites = Vec::new();
        while payload.has_remaining() {
            let name_len = payload.get_u8() as usize;
            if payload.remaining() < name_len + 24 {
                return Err(malformed("truncated site"));
            }
            let name = String::from_utf8_lossy(&payload[..name_len]).into_owned();
            payload.advance(name_len);
            sites.push(TimingSite {
                name,
                count: payload.get_u64_le(),
                total: Duration::from_nanos(payload.get_u64_le()),
                max: Duration::from_nanos(payload.get_u64_le()),
            });
        }
        Ok(sites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_site_registration_is_idempotent() {
        let mut registry = TimingRegistry::new();
        let a = registry.site("poll");
        let b = registry.site("distribute");
        assert_ne!(a, b);
        assert_eq!(registry.site("poll"), a);
        assert_eq!(registry.sites().len(), 2);
    }

    #[test]
    fn test_record_accumulates() {
        let mut registry = TimingRegistry::new();
        let id = registry.site("distribute");
        registry.record(id, Duration::from_micros(10));
        registry.record(id, Duration::from_micros(30));

        let site = registry.get(id);
        assert_eq!(site.count, 2);
        assert_eq!(site.total, Duration::from_micros(40));
        assert_eq!(site.max, Duration::from_micros(30));
        assert_eq!(site.mean(), Duration::from_micros(20));
    }

    #[test]
    fn test_mean_with_count_past_u32() {
        // 2^32 would truncate to a zero divisor as a u32
        let site = TimingSite {
            name: "wait".into(),
            count: 1 << 32,
            total: Duration::from_nanos(3 << 32),
            max: Duration::from_nanos(5),
        };
        assert_eq!(site.mean(), Duration::from_nanos(3));

        let site = TimingSite {
            count: (1 << 32) + 1,
            total: Duration::from_nanos(((1 << 32) + 1) * 7),
            ..site
        };
        assert_eq!(site.mean(), Duration::from_nanos(7));
    }

    #[test]
    fn test_separate_registries_are_independent() {
        let mut a = TimingRegistry::new();
        let b = TimingRegistry::new();
        let id = a.site("x");
        a.record(id, Duration::from_millis(1));
        assert!(b.sites().is_empty());
    }

    #[test]
    fn test_payload() {
        let mut registry = TimingRegistry::new();
        let id = registry.site("canary_check");
        registry.record(id, Duration::from_nanos(1500));
        registry.site("idle");

        let decoded = TimingRegistry::decode(&registry.encode()).unwrap();
        assert_eq!(decoded, registry.sites());

        let truncated = registry.encode();
        assert!(TimingRegistry::decode(&truncated[..10]).is_err());
    }
}
