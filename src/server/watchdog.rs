//! Idle-socket watchdog
//!
//! Every live WebSocket registers its activity clock here. A sweeper task
//! walks the table on a fixed cadence and asks handlers to close sockets
//! that have been idle too long; the handlers own the actual close.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info};

use super::connection::SocketActivity;

/// Sweep cadence
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Idle threshold after which a socket is closed
const IDLE_LIMIT: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
pub struct SocketTable {
    sockets: DashMap<u64, Arc<SocketActivity>>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session_id: u64, activity: Arc<SocketActivity>) {
        self.sockets.insert(session_id, activity);
    }

    pub fn unregister(&self, session_id: u64) {
        self.sockets.remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// One sweep pass; returns how many sockets were asked to close.
    pub fn sweep(&self, idle_limit: Duration) -> usize {
        let mut closed = 0;
        for entry in self.sockets.iter() {
            let activity = entry.value();
            if activity.close_requested() {
                continue;
            }
            if activity.idle_millis() > idle_limit.as_millis() as u64 {
                debug!("Watchdog closing idle socket {}", entry.key());
                activity.request_close();
                closed += 1;
            }
        }
        closed
    }
}

/// Spawn the periodic sweeper.
pub fn spawn_watchdog(table: Arc<SocketTable>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await; // immediate first tick is a no-op
        loop {
            interval.tick().await;
            let closed = table.sweep(IDLE_LIMIT);
            if closed > 0 {
                info!("Watchdog closed {} idle sockets ({} live)", closed, table.len());
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweeps_only_idle_sockets() {
        let table = SocketTable::new();
        let fresh = SocketActivity::new();
        let stale = SocketActivity::new();
        table.register(1, fresh.clone());
        table.register(2, stale.clone());

        // A zero idle limit flags everything that has not been touched in
        // this instant; touch the fresh one right before sweeping.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fresh.touch();

        let closed = table.sweep(Duration::from_millis(10));
        assert_eq!(closed, 1);
        assert!(stale.close_requested());
        assert!(!fresh.close_requested());

        // Already-flagged sockets are not counted twice
        assert_eq!(table.sweep(Duration::from_millis(10)), 0);
    }
}
