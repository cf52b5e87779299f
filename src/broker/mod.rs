//! Message broker
//!
//! Members connect over a Unix socket, authenticate with their fixed member
//! id and then exchange frames through the broker:
//!
//! - control frames (subscribe, mute, deafen, timing, disconnect) are applied
//!   by the broker itself
//! - every other frame goes to the members subscribed to its message id, in
//!   subscription order, unless the sender is muted or the receiver deaf
//!
//! A member that cannot keep up loses frames rather than stalling the others.

pub mod config;
pub mod hub;
pub mod member;
pub mod subscriptions;

pub use config::BrokerConfig;
pub use hub::Broker;
pub use member::{DisconnectReason, MemberRecord};
pub use subscriptions::SubscriptionTable;
