//! Statistics and timing

pub mod metrics;
pub mod timing;

pub use metrics::{BrokerStats, MemberStats, RateSample};
pub use timing::{SiteId, TimingRegistry, TimingSite};
