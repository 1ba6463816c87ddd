//! Monitoring fan-out core
//!
//! Collectors bound to SSH sessions and external agents feed raw samples in;
//! normalized frames land in the cache and are pushed to `/monitor`
//! subscribers resolved by fuzzy host identifiers.

pub mod cache;
pub mod collector;
pub mod frame;
pub mod handler;
pub mod hub;
pub mod normalizer;

pub use cache::FrameCache;
pub use collector::CollectorConfig;
pub use frame::{HostIdentity, TelemetryFrame};
pub use hub::{MonitorHub, StatusHint, SubscriberQueue};
