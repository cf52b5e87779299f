//! Broker configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::constants::*;
use crate::shm::RegionLayout;

/// Broker configuration options
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Path of the listening Unix socket
    pub socket_path: PathBuf,

    /// Directory holding the shared region file
    pub shm_dir: PathBuf,

    /// Fixed shared region id (None = random per start)
    pub region_id: Option<u32>,

    /// Slot layout of the shared region
    pub layout: RegionLayout,

    /// Largest payload accepted from members
    pub max_payload: usize,

    /// Bound on the blocking auth exchange (None = wait for the member)
    pub handshake_timeout: Option<Duration>,

    /// Bound on blocking sends (None = block while the peer stalls)
    pub write_timeout: Option<Duration>,

    /// Multiplexer wait used by `run`/`run_until` (None = until readiness)
    pub poll_timeout: Option<Duration>,

    /// Frames read from one member per readiness before yielding to others
    pub max_frames_per_wake: usize,

    /// Broker_Stats broadcast interval
    pub stats_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            region_id: None,
            layout: RegionLayout::default(),
            max_payload: MAX_PAYLOAD_LEN,
            handshake_timeout: None,
            write_timeout: None,
            poll_timeout: None,
            max_frames_per_wake: 64,
            stats_interval: Duration::from_secs(1),
        }
    }
}

impl BrokerConfig {
    /// Create a new config listening on `path`
    pub fn with_socket(path: impl AsRef<Path>) -> Self {
        Self {
            socket_path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Set the socket path
    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    /// Set the shared region directory
    pub fn shm_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.shm_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Use a fixed region id
    pub fn region_id(mut self, id: u32) -> Self {
        self.region_id = Some(id);
        self
    }

    /// Set the region slot layout
    pub fn layout(mut self, layout: RegionLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Set the payload limit (capped at the wire maximum)
    pub fn max_payload(mut self, max: usize) -> Self {
        self.max_payload = max.min(MAX_PAYLOAD_LEN);
        self
    }

    /// Set handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }

    /// Set write timeout for blocking sends
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Set the multiplexer wait timeout
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    /// Set the per-wake read budget (at least one frame)
    pub fn max_frames_per_wake(mut self, max: usize) -> Self {
        self.max_frames_per_wake = max.max(1);
        self
    }

    /// Set stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }
}
