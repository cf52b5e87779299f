//! Protocol constants

/// Fixed frame header size in bytes
pub const HEADER_SIZE: usize = 8;

/// Largest payload representable in the 24-bit length field
pub const MAX_PAYLOAD_LEN: usize = (1 << 24) - 1;

/// Constant carried in every auth response ("MBUS")
pub const AUTH_MAGIC: u32 = 0x4D42_5553;

/// Highest member id; ids index a 16-bit online bitmask
pub const MAX_MEMBER_ID: u16 = 15;

/// Well-known broker socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/membus.sock";

/// Directory holding the shared region file
pub const DEFAULT_SHM_DIR: &str = "/dev/shm";
