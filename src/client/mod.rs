//! Member client
//!
//! Async (tokio) side of the protocol for processes that join the bus:
//! authenticate, subscribe, send and receive frames, and publish or read
//! large payloads through the shared region.

pub mod config;
pub mod member;

pub use config::ClientConfig;
pub use member::MemberClient;
