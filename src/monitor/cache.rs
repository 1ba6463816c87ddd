//! Frame cache and host-id index
//!
//! Holds the latest [`TelemetryFrame`] per canonical host id, plus a
//! bidirectional index between bare hostnames/IPs and the combined
//! `hostname@ip` form, so lookups succeed whichever shape the caller has.

use chrono::Utc;
use dashmap::DashMap;

use super::frame::{HostIdentity, TelemetryFrame};

/// Frames older than this are not replayed to new subscribers (seconds)
pub const FRESHNESS_WINDOW_SECS: i64 = 60;

#[derive(Default)]
pub struct FrameCache {
    /// canonical host id -> latest frame
    frames: DashMap<String, TelemetryFrame>,
    /// bare hostname or IP -> canonical host id
    host_index: DashMap<String, String>,
}

impl FrameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached frame for a host and refresh the index.
    pub fn insert(&self, identity: &HostIdentity, frame: TelemetryFrame) {
        let canonical = identity.canonical();
        for descriptor in identity.descriptors() {
            if descriptor != canonical {
                self.host_index.insert(descriptor, canonical.clone());
            }
        }
        self.frames.insert(canonical, frame);
    }

    /// Resolve any descriptor shape to the canonical id, if known.
    pub fn resolve(&self, descriptor: &str) -> Option<String> {
        if self.frames.contains_key(descriptor) {
            return Some(descriptor.to_string());
        }
        self.host_index
            .get(descriptor)
            .map(|entry| entry.value().clone())
    }

    /// Latest frame for a descriptor, regardless of age.
    pub fn get(&self, descriptor: &str) -> Option<TelemetryFrame> {
        let canonical = self.resolve(descriptor)?;
        self.frames.get(&canonical).map(|e| e.value().clone())
    }

    /// Latest frame for a descriptor when written within the freshness
    /// window.
    pub fn get_fresh(&self, descriptor: &str) -> Option<TelemetryFrame> {
        let frame = self.get(descriptor)?;
        let age_ms = Utc::now().timestamp_millis() - frame.last_updated;
        (age_ms <= FRESHNESS_WINDOW_SECS * 1000).then_some(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ms_ago: i64) -> TelemetryFrame {
        TelemetryFrame {
            last_updated: Utc::now().timestamp_millis() - ms_ago,
            ..Default::default()
        }
    }

    #[test]
    fn one_frame_per_host() {
        let cache = FrameCache::new();
        let id = HostIdentity::parse("prod-1@1.2.3.4");
        cache.insert(&id, frame(0));
        cache.insert(&id, frame(0));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn resolves_all_descriptor_shapes() {
        let cache = FrameCache::new();
        let id = HostIdentity::parse("prod-1@1.2.3.4");
        cache.insert(&id, frame(0));

        for descriptor in ["prod-1", "1.2.3.4", "prod-1@1.2.3.4"] {
            assert!(cache.get(descriptor).is_some(), "missed {}", descriptor);
        }
        assert!(cache.get("other").is_none());
    }

    #[test]
    fn freshness_window() {
        let cache = FrameCache::new();
        let id = HostIdentity::parse("prod-1@1.2.3.4");
        cache.insert(&id, frame(0));
        assert!(cache.get_fresh("1.2.3.4").is_some());

        cache.insert(&id, frame((FRESHNESS_WINDOW_SECS + 5) * 1000));
        assert!(cache.get_fresh("1.2.3.4").is_none());
        assert!(cache.get("1.2.3.4").is_some());
    }
}
