//! Member client configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::constants::*;
use crate::protocol::MemberId;

/// Member client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker socket
    pub socket_path: PathBuf,

    /// Directory holding the shared region file
    pub shm_dir: PathBuf,

    /// Identity presented in the auth request
    pub member_id: MemberId,

    /// Largest payload accepted from the broker
    pub max_payload: usize,

    /// Connection timeout
    pub connect_timeout: Duration,

    /// How long to wait for the auth response
    pub auth_timeout: Duration,
}

impl ClientConfig {
    /// Create a config for `member_id` with default paths
    pub fn new(member_id: MemberId) -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            shm_dir: PathBuf::from(DEFAULT_SHM_DIR),
            member_id,
            max_payload: MAX_PAYLOAD_LEN,
            connect_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(5),
        }
    }

    pub fn socket_path(mut self, path: impl AsRef<Path>) -> Self {
        self.socket_path = path.as_ref().to_path_buf();
        self
    }

    pub fn shm_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.shm_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the payload limit (capped at the wire maximum)
    pub fn max_payload(mut self, max: usize) -> Self {
        self.max_payload = max.min(MAX_PAYLOAD_LEN);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_config() {
        let config = ClientConfig::new(MemberId::DASHBOARD);

        assert_eq!(config.member_id, MemberId::DASHBOARD);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.shm_dir, PathBuf::from(DEFAULT_SHM_DIR));
        assert_eq!(config.max_payload, MAX_PAYLOAD_LEN);
    }

    #[test]
    fn test_builder_chaining() {
        let config = ClientConfig::new(MemberId::CAN_BRIDGE)
            .socket_path("/tmp/bus.sock")
            .shm_dir("/tmp/shm")
            .max_payload(usize::MAX)
            .connect_timeout(Duration::from_millis(250))
            .auth_timeout(Duration::from_secs(1));

        assert_eq!(config.socket_path, PathBuf::from("/tmp/bus.sock"));
        assert_eq!(config.shm_dir, PathBuf::from("/tmp/shm"));
        assert_eq!(config.max_payload, MAX_PAYLOAD_LEN);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.auth_timeout, Duration::from_secs(1));
    }
}
