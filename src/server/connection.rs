//! Per-socket shared state: ids, activity tracking, outbound byte budget

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Outbound byte budget per socket (1 MiB)
pub const OUTBOUND_BUDGET_BYTES: usize = 1024 * 1024;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-scope, monotonically-unique socket session id.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Activity clock for one WebSocket, shared with the watchdog sweeper.
pub struct SocketActivity {
    last_seen: AtomicU64,
    close: Notify,
    closed: AtomicU64,
}

impl SocketActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            last_seen: AtomicU64::new(now_millis()),
            close: Notify::new(),
            closed: AtomicU64::new(0),
        })
    }

    /// Record activity (any inbound frame, or an outbound send).
    pub fn touch(&self) {
        self.last_seen.store(now_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since the last recorded activity.
    pub fn idle_millis(&self) -> u64 {
        now_millis().saturating_sub(self.last_seen.load(Ordering::Relaxed))
    }

    /// Ask the owning handler to close its socket.
    pub fn request_close(&self) {
        self.closed.store(1, Ordering::Relaxed);
        self.close.notify_waiters();
    }

    pub fn close_requested(&self) -> bool {
        self.closed.load(Ordering::Relaxed) != 0
    }

    /// Resolves once [`request_close`](Self::request_close) has been called.
    pub async fn closed(&self) {
        loop {
            // Register before re-checking: notify_waiters only wakes waiters
            // that are already enlisted.
            let notified = self.close.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.close_requested() {
                return;
            }
            notified.await;
        }
    }
}

/// Byte budget for a socket's outbound queue.
///
/// SSH pumps `acquire` and therefore pause while the budget is exhausted;
/// monitoring fan-out uses `try_acquire` and drops instead. Bytes are
/// released by the writer after the frame has been handed to the socket.
pub struct OutboundBudget {
    limit: usize,
    used: AtomicUsize,
    freed: Notify,
}

impl OutboundBudget {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicUsize::new(0),
            freed: Notify::new(),
        })
    }

    pub fn with_default_limit() -> Arc<Self> {
        Self::new(OUTBOUND_BUDGET_BYTES)
    }

    fn try_reserve(&self, n: usize) -> bool {
        let mut used = self.used.load(Ordering::Acquire);
        loop {
            // A chunk larger than the whole budget is admitted alone so it
            // cannot deadlock the pump.
            if used != 0 && used + n > self.limit {
                return false;
            }
            match self.used.compare_exchange_weak(
                used,
                used + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => used = actual,
            }
        }
    }

    /// Reserve `n` bytes, waiting for the writer to drain if necessary.
    pub async fn acquire(&self, n: usize) {
        loop {
            if self.try_reserve(n) {
                return;
            }
            // Register before the re-check so a release between the two
            // cannot be missed.
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();
            if self.try_reserve(n) {
                return;
            }
            freed.await;
        }
    }

    /// Reserve `n` bytes without waiting.
    pub fn try_acquire(&self, n: usize) -> bool {
        self.try_reserve(n)
    }

    /// Return `n` bytes to the budget.
    pub fn release(&self, n: usize) {
        self.used.fetch_sub(n, Ordering::AcqRel);
        self.freed.notify_waiters();
    }

    pub fn in_use(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_increasing() {
        let a = next_session_id();
        let b = next_session_id();
        assert!(b > a);
    }

    #[tokio::test]
    async fn budget_blocks_until_released() {
        let budget = OutboundBudget::new(100);
        budget.acquire(80).await;
        assert!(!budget.try_acquire(40));

        let budget2 = budget.clone();
        let waiter = tokio::spawn(async move {
            budget2.acquire(40).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        budget.release(80);
        waiter.await.unwrap();
        assert_eq!(budget.in_use(), 40);
    }

    #[tokio::test]
    async fn oversized_chunk_admitted_when_empty() {
        let budget = OutboundBudget::new(10);
        budget.acquire(500).await;
        assert_eq!(budget.in_use(), 500);
        assert!(!budget.try_acquire(1));
        budget.release(500);
        assert!(budget.try_acquire(1));
    }

    #[tokio::test]
    async fn activity_close_signal() {
        let activity = SocketActivity::new();
        assert!(!activity.close_requested());
        let a = activity.clone();
        let waiter = tokio::spawn(async move { a.closed().await });
        activity.request_close();
        waiter.await.unwrap();
        assert!(activity.close_requested());
    }
}
