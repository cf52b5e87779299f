//! Shared memory for large payloads
//!
//! Camera and processed images are too large to push through the broker on
//! every cycle. Producers write them into a rotating slot of the shared
//! region and send a small frame carrying a [`SlotAnnouncement`]; consumers
//! copy the slot straight out of the region.
//!
//! The region also holds the online-members bitmask and the canary guard
//! words the broker checks on every iteration.

pub mod canary;
pub mod layout;
pub mod region;

pub use canary::{Canary, CanarySet};
pub use layout::{KindLayout, RegionLayout, SlotKind};
pub use region::{region_path, SharedRegion, SlotAnnouncement};
