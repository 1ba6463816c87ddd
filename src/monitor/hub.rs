//! Monitoring fan-out hub
//!
//! Owns the frame cache, the subscription index, and the per-subscriber
//! status hysteresis. Ingress (inline collectors and `/monitor-client`
//! agents) is synchronous within the calling task; delivery to subscribers
//! goes through bounded queues with a drop-oldest overflow policy, so a slow
//! dashboard can never stall a collector.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use super::cache::FrameCache;
use super::frame::{HostIdentity, TelemetryFrame};
use super::normalizer;

/// Queued frames per subscriber before the oldest is dropped
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// Last status value pushed to a subscriber for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusHint {
    Installed,
    NotInstalled,
}

impl StatusHint {
    fn as_str(self) -> &'static str {
        match self {
            StatusHint::Installed => "installed",
            StatusHint::NotInstalled => "not_installed",
        }
    }
}

/// Bounded outbound queue for one `/monitor` socket.
///
/// Monitoring frames are droppable: on overflow the oldest queued frame is
/// discarded (`dropPolicy: oldest`). SSH payloads never travel through here.
pub struct SubscriberQueue {
    queue: Mutex<VecDeque<Value>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a frame, dropping the oldest when full.
    pub fn push(&self, frame: Value) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(frame);
        }
        self.notify.notify_one();
    }

    /// Dequeue the next frame; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<Value> {
        loop {
            if let Some(frame) = self.queue.lock().pop_front() {
                return Some(frame);
            }
            // Enlist before re-checking so a push or close racing with the
            // empty check cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(frame) = self.queue.lock().pop_front() {
                return Some(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct Subscriber {
    queue: Arc<SubscriberQueue>,
    /// Raw serverId strings this subscriber asked for
    subscribed: Mutex<HashSet<String>>,
    /// Host key -> last status pushed (hysteresis memory)
    hints: Mutex<HashMap<String, StatusHint>>,
}

impl Subscriber {
    /// Push a status frame unless it would repeat the last one for this
    /// host. Returns whether a frame went out.
    fn push_status(&self, host_key: &str, status: StatusHint, message: &str) -> bool {
        {
            let mut hints = self.hints.lock();
            if hints.get(host_key) == Some(&status) {
                return false;
            }
            hints.insert(host_key.to_string(), status);
        }
        self.queue.push(json!({
            "type": "monitoring_status",
            "data": {
                "hostId": host_key,
                "status": status.as_str(),
                "available": status == StatusHint::Installed,
                "message": message,
                "timestamp": Utc::now().timestamp_millis(),
            },
        }));
        true
    }

    fn push_stats(&self, frame: &TelemetryFrame, cached: bool) {
        let mut envelope = json!({
            "type": "system_stats",
            "payload": frame,
        });
        if cached {
            envelope["cached"] = Value::Bool(true);
        }
        self.queue.push(envelope);
    }
}

#[derive(Default)]
pub struct MonitorHub {
    cache: FrameCache,
    subscribers: DashSubscribers,
    /// serverId -> subscriber ids
    index: dashmap::DashMap<String, HashSet<u64>>,
}

type DashSubscribers = dashmap::DashMap<u64, Arc<Subscriber>>;

impl MonitorHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache(&self) -> &FrameCache {
        &self.cache
    }

    /// Register a `/monitor` socket; the returned queue feeds its writer.
    pub fn register_subscriber(&self, subscriber_id: u64) -> Arc<SubscriberQueue> {
        let queue = Arc::new(SubscriberQueue::new(SUBSCRIBER_QUEUE_CAPACITY));
        let subscriber = Arc::new(Subscriber {
            queue: queue.clone(),
            subscribed: Mutex::new(HashSet::new()),
            hints: Mutex::new(HashMap::new()),
        });
        self.subscribers.insert(subscriber_id, subscriber);
        debug!("Monitor subscriber {} registered", subscriber_id);
        queue
    }

    /// Drop a subscriber and every index entry pointing at it.
    pub fn remove_subscriber(&self, subscriber_id: u64) {
        if let Some((_, subscriber)) = self.subscribers.remove(&subscriber_id) {
            subscriber.queue.close();
            let subscribed = subscriber.subscribed.lock().clone();
            for server_id in subscribed {
                self.drop_from_index(&server_id, subscriber_id);
            }
            if subscriber.queue.dropped() > 0 {
                warn!(
                    "Monitor subscriber {} lost {} frames to backpressure",
                    subscriber_id,
                    subscriber.queue.dropped()
                );
            }
        }
        debug!("Monitor subscriber {} removed", subscriber_id);
    }

    /// `subscribe_server`: register interest, then replay the cached frame
    /// when it is fresh enough.
    pub fn subscribe(&self, subscriber_id: u64, server_id: &str) {
        let Some(subscriber) = self.get_subscriber(subscriber_id) else {
            return;
        };

        subscriber.subscribed.lock().insert(server_id.to_string());
        self.index
            .entry(server_id.to_string())
            .or_default()
            .insert(subscriber_id);

        if let Some(frame) = self.cache.get_fresh(server_id) {
            let host_key = self
                .cache
                .resolve(server_id)
                .unwrap_or_else(|| server_id.to_string());
            subscriber.push_status(&host_key, StatusHint::Installed, "monitoring data available");
            subscriber.push_stats(&frame, true);
        }
    }

    /// `unsubscribe_server`. The collector keeps running; it is bound to the
    /// SSH session, not to subscriber presence.
    pub fn unsubscribe(&self, subscriber_id: u64, server_id: &str) {
        if let Some(subscriber) = self.get_subscriber(subscriber_id) {
            subscriber.subscribed.lock().remove(server_id);
        }
        self.drop_from_index(server_id, subscriber_id);
    }

    /// `request_system_stats`: replay from cache, or report `not_installed`
    /// exactly once per hysteresis edge.
    pub fn request_stats(&self, subscriber_id: u64, host_id: &str) {
        let Some(subscriber) = self.get_subscriber(subscriber_id) else {
            return;
        };

        match self.cache.get_fresh(host_id) {
            Some(frame) => {
                let host_key = self
                    .cache
                    .resolve(host_id)
                    .unwrap_or_else(|| host_id.to_string());
                subscriber.push_status(&host_key, StatusHint::Installed, "monitoring data available");
                subscriber.push_stats(&frame, true);
            }
            None => {
                let host_key = self
                    .cache
                    .resolve(host_id)
                    .unwrap_or_else(|| host_id.to_string());
                subscriber.push_status(
                    &host_key,
                    StatusHint::NotInstalled,
                    "no monitoring data for host",
                );
            }
        }
    }

    /// `abort`: acknowledged only. Collectors follow the SSH session
    /// lifetime, so nothing is stopped here.
    pub fn abort(&self, subscriber_id: u64, server_id: &str) -> usize {
        let count = self
            .index
            .get(server_id)
            .map(|subs| subs.len())
            .unwrap_or(0);
        debug!(
            "Abort from subscriber {} for {} acknowledged ({} subscribers)",
            subscriber_id, server_id, count
        );
        count
    }

    /// Ingest a raw sample from a collector or an external agent.
    ///
    /// Returns the host identity on success so the caller can log it.
    pub fn ingest(
        &self,
        raw: &Value,
        source: &str,
        session_id: Option<&str>,
    ) -> Option<HostIdentity> {
        let (identity, frame) = normalizer::normalize(raw, source, session_id)?;
        self.cache.insert(&identity, frame.clone());
        self.fan_out(&identity, &frame);
        Some(identity)
    }

    /// Collector hit a connection-error pattern: tell everyone watching.
    pub fn collector_disconnected(&self, identity: &HostIdentity, session_id: &str) {
        let timestamp = Utc::now().timestamp_millis();
        for subscriber in self.watchers(identity) {
            subscriber.queue.push(json!({
                "type": "monitoring_disconnected",
                "data": {
                    "hostId": identity.canonical(),
                    "sessionId": session_id,
                    "timestamp": timestamp,
                },
            }));
            // Next successful sample flips the hint back to installed
            subscriber
                .hints
                .lock()
                .insert(identity.canonical(), StatusHint::NotInstalled);
        }
    }

    /// Push one fresh frame to every subscriber watching any descriptor of
    /// the host. Each subscriber gets at most one status edge and exactly
    /// one stats frame per ingress.
    fn fan_out(&self, identity: &HostIdentity, frame: &TelemetryFrame) {
        let watchers = self.watchers(identity);
        if watchers.is_empty() {
            trace!("No subscribers for {}", identity);
            return;
        }

        let host_key = identity.canonical();
        for subscriber in watchers {
            subscriber.push_status(&host_key, StatusHint::Installed, "monitoring data available");
            subscriber.push_stats(frame, false);
        }
    }

    /// Subscribers watching any descriptor of a host, deduplicated.
    fn watchers(&self, identity: &HostIdentity) -> Vec<Arc<Subscriber>> {
        let mut seen: HashSet<u64> = HashSet::new();
        let mut out = Vec::new();
        for descriptor in identity.descriptors() {
            if let Some(ids) = self.index.get(&descriptor) {
                for id in ids.iter() {
                    if seen.insert(*id) {
                        if let Some(subscriber) = self.get_subscriber(*id) {
                            out.push(subscriber);
                        }
                    }
                }
            }
        }
        out
    }

    fn get_subscriber(&self, subscriber_id: u64) -> Option<Arc<Subscriber>> {
        self.subscribers
            .get(&subscriber_id)
            .map(|entry| entry.value().clone())
    }

    fn drop_from_index(&self, server_id: &str, subscriber_id: u64) {
        if let Some(mut ids) = self.index.get_mut(server_id) {
            ids.remove(&subscriber_id);
            if ids.is_empty() {
                drop(ids);
                self.index.remove_if(server_id, |_, ids| ids.is_empty());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample(host_id: &str, cpu: f64) -> Value {
        json!({
            "hostId": host_id,
            "cpu": {"usage": cpu, "cores": 4},
            "memory": {"total": 1000, "used": 400},
        })
    }

    async fn drain(queue: &SubscriberQueue) -> Vec<Value> {
        let mut out = Vec::new();
        while let Some(frame) = {
            let popped = queue.queue.lock().pop_front();
            popped
        } {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn subscribe_then_ingress_sends_status_then_stats_once() {
        let hub = MonitorHub::new();
        let queue = hub.register_subscriber(1);

        // Cache empty: subscribe delivers nothing
        hub.subscribe(1, "1.2.3.4");
        assert!(drain(&queue).await.is_empty());

        // First frame: status then stats
        hub.ingest(&sample("prod-1@1.2.3.4", 10.0), "collector", Some("s1"))
            .unwrap();
        let frames = drain(&queue).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["type"], "monitoring_status");
        assert_eq!(frames[0]["data"]["status"], "installed");
        assert_eq!(frames[1]["type"], "system_stats");

        // Second frame: stats only (status suppressed by hysteresis)
        hub.ingest(&sample("prod-1@1.2.3.4", 20.0), "collector", Some("s1"))
            .unwrap();
        let frames = drain(&queue).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "system_stats");
    }

    #[tokio::test]
    async fn request_stats_hysteresis_on_miss() {
        let hub = MonitorHub::new();
        let queue = hub.register_subscriber(1);

        hub.request_stats(1, "prod-1");
        let frames = drain(&queue).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["status"], "not_installed");

        // Second identical request: suppressed
        hub.request_stats(1, "prod-1");
        assert!(drain(&queue).await.is_empty());
    }

    #[tokio::test]
    async fn request_stats_replays_cached_frame() {
        let hub = MonitorHub::new();
        hub.ingest(&sample("prod-1@1.2.3.4", 10.0), "collector", None)
            .unwrap();

        let queue = hub.register_subscriber(1);
        hub.request_stats(1, "prod-1");
        let frames = drain(&queue).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["data"]["status"], "installed");
        assert_eq!(frames[1]["cached"], true);
    }

    #[tokio::test]
    async fn subscriber_deduplicated_across_descriptors() {
        let hub = MonitorHub::new();
        let queue = hub.register_subscriber(1);
        // Watching both the IP and the combined id
        hub.subscribe(1, "1.2.3.4");
        hub.subscribe(1, "prod-1@1.2.3.4");

        hub.ingest(&sample("prod-1@1.2.3.4", 10.0), "collector", None)
            .unwrap();
        let frames = drain(&queue).await;
        // One status + one stats, not two of each
        assert_eq!(frames.len(), 2);
    }

    #[tokio::test]
    async fn unsubscribe_clears_empty_index_entry() {
        let hub = MonitorHub::new();
        hub.register_subscriber(1);
        hub.subscribe(1, "1.2.3.4");
        assert!(hub.index.get("1.2.3.4").is_some());
        hub.unsubscribe(1, "1.2.3.4");
        assert!(hub.index.get("1.2.3.4").is_none());
    }

    #[tokio::test]
    async fn queue_drops_oldest_on_overflow() {
        let queue = SubscriberQueue::new(2);
        queue.push(json!({"seq": 1}));
        queue.push(json!({"seq": 2}));
        queue.push(json!({"seq": 3}));
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await.unwrap()["seq"], 2);
        assert_eq!(queue.pop().await.unwrap()["seq"], 3);
    }

    #[tokio::test]
    async fn subscribe_replays_fresh_cache() {
        let hub = MonitorHub::new();
        hub.ingest(&sample("prod-1@1.2.3.4", 10.0), "collector", None)
            .unwrap();

        let queue = hub.register_subscriber(7);
        hub.subscribe(7, "1.2.3.4");
        let frames = drain(&queue).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["data"]["status"], "installed");
        assert_eq!(frames[1]["cached"], true);
    }
}
