//! membus: single-host message bus for cooperating robot processes
//!
//! Every process (camera driver, CAN bridge, network bridge, control,
//! dashboard) is a *member* with a fixed id. Members connect to one broker
//! over a Unix socket and exchange small framed messages through it; large
//! images go through a shared memory region and only a slot announcement
//! travels over the socket.
//!
//! # Layout
//!
//! - [`protocol`]: wire header, frames, message ids and the auth handshake
//! - [`connection`]: framed, counter-checked stream with partial I/O handling
//! - [`mux`]: readiness wait over many descriptors
//! - [`shm`]: shared region, slot publication and canary guards
//! - [`broker`]: the hub (auth, subscriptions, fan-out, stats)
//! - [`client`]: async member side
//! - [`stats`]: throughput counters and timing sites
//!
//! # Example
//! ```no_run
//! use membus::broker::{Broker, BrokerConfig};
//!
//! # fn main() -> membus::error::Result<()> {
//! let mut broker = Broker::bind(BrokerConfig::with_socket("/tmp/membus.sock"))?;
//! broker.run()?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod buffer;
pub mod client;
pub mod connection;
pub mod error;
pub mod mux;
pub mod protocol;
pub mod shm;
pub mod stats;

pub use broker::{Broker, BrokerConfig};
pub use buffer::ByteBuffer;
pub use client::{ClientConfig, MemberClient};
pub use connection::{Connection, SendMode, SendOutcome};
pub use error::{Error, Result};
pub use mux::{Multiplexer, MuxWaker};
pub use protocol::{Frame, MemberId, MessageId};
pub use shm::{RegionLayout, SharedRegion, SlotKind};
