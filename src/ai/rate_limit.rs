//! Per-user sliding-window rate limiter
//!
//! Five gates evaluated in order: burst, minute, hour, day, cooldown. The
//! first failing gate rejects the request and records nothing; a full pass
//! appends to the burst window and increments the three bucket counters.
//! Counters live behind a per-user critical section so check-and-record is
//! atomic.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub burst_limit: usize,
    pub burst_window_secs: i64,
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    pub cooldown_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst_limit: 10,
            burst_window_secs: 10,
            requests_per_minute: 60,
            requests_per_hour: 300,
            requests_per_day: 1000,
            cooldown_secs: 60,
        }
    }
}

/// Outcome of one limiter check.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// Seconds until the failing gate resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<i64>,
    pub message: String,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            reset_time: None,
            message: "ok".to_string(),
        }
    }

    fn rejected(reason: &'static str, reset_time: i64, message: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            reset_time: Some(reset_time.max(0)),
            message,
        }
    }
}

/// Fixed-window counter keyed by its bucket number; rolls over when the
/// wall clock enters a new bucket.
#[derive(Debug, Default, Clone, Copy)]
struct BucketCounter {
    bucket: i64,
    count: u64,
}

impl BucketCounter {
    fn current(&mut self, bucket: i64) -> u64 {
        if self.bucket != bucket {
            self.bucket = bucket;
            self.count = 0;
        }
        self.count
    }

    fn increment(&mut self, bucket: i64) {
        if self.bucket != bucket {
            self.bucket = bucket;
            self.count = 0;
        }
        self.count += 1;
    }
}

#[derive(Debug, Default)]
struct RateWindows {
    /// Timestamps (ms) of requests inside the burst window
    burst: VecDeque<i64>,
    minute: BucketCounter,
    hour: BucketCounter,
    day: BucketCounter,
    /// Absolute cooldown expiry (ms), if set
    cooldown_until: Option<i64>,
}

#[derive(Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    users: DashMap<String, Arc<Mutex<RateWindows>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            users: DashMap::new(),
        }
    }

    /// Check and, if all gates pass, record the request.
    pub fn check(&self, user_id: &str) -> RateDecision {
        self.check_at(user_id, Utc::now())
    }

    /// Gate evaluation at an explicit instant (tests drive this directly).
    pub fn check_at(&self, user_id: &str, now: DateTime<Utc>) -> RateDecision {
        let windows = self
            .users
            .entry(user_id.to_string())
            .or_default()
            .clone();
        let mut windows = windows.lock();

        let now_ms = now.timestamp_millis();
        let burst_window_ms = self.config.burst_window_secs * 1000;

        // 1. Burst: rolling window of timestamps
        while let Some(&oldest) = windows.burst.front() {
            if now_ms - oldest >= burst_window_ms {
                windows.burst.pop_front();
            } else {
                break;
            }
        }
        if windows.burst.len() >= self.config.burst_limit {
            let oldest = *windows.burst.front().expect("burst non-empty");
            let reset = (oldest + burst_window_ms - now_ms + 999) / 1000;
            // Rapid-fire abuse also arms the cooldown gate
            windows.cooldown_until = Some(now_ms + self.config.cooldown_secs * 1000);
            debug!("Burst limit exceeded for user {}", user_id);
            return RateDecision::rejected(
                "BURST_LIMIT_EXCEEDED",
                reset,
                format!(
                    "too many requests in {}s, retry in {}s",
                    self.config.burst_window_secs, reset
                ),
            );
        }

        // 2. Minute
        let minute_bucket = now.timestamp() / 60;
        if windows.minute.current(minute_bucket) >= self.config.requests_per_minute {
            let reset = 60 - i64::from(now.second());
            return RateDecision::rejected(
                "MINUTE_LIMIT_EXCEEDED",
                reset,
                format!("minute limit reached, retry in {}s", reset),
            );
        }

        // 3. Hour
        let hour_bucket = now.timestamp() / 3600;
        if windows.hour.current(hour_bucket) >= self.config.requests_per_hour {
            let reset = 3600 - i64::from(now.minute()) * 60 - i64::from(now.second());
            return RateDecision::rejected(
                "HOUR_LIMIT_EXCEEDED",
                reset,
                format!("hourly limit reached, retry in {}s", reset),
            );
        }

        // 4. Day (UTC midnight reset)
        let day_bucket = i64::from(now.ordinal()) + now.year() as i64 * 1000;
        if windows.day.current(day_bucket) >= self.config.requests_per_day {
            let midnight = Utc
                .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
                .single()
                .map(|d| d.timestamp() + 86_400)
                .unwrap_or(now.timestamp());
            let reset = midnight - now.timestamp();
            return RateDecision::rejected(
                "DAILY_LIMIT_EXCEEDED",
                reset,
                format!("daily limit reached, retry in {}s", reset),
            );
        }

        // 5. Cooldown
        if let Some(until) = windows.cooldown_until {
            if now_ms < until {
                let reset = (until - now_ms + 999) / 1000;
                return RateDecision::rejected(
                    "COOLDOWN_ACTIVE",
                    reset,
                    format!("cooldown active, retry in {}s", reset),
                );
            }
            windows.cooldown_until = None;
        }

        // All gates passed: record
        windows.burst.push_back(now_ms);
        windows.minute.increment(minute_bucket);
        windows.hour.increment(hour_bucket);
        windows.day.increment(day_bucket);

        RateDecision::allowed()
    }

    /// Arm an explicit cooldown for a user.
    pub fn trigger_cooldown(&self, user_id: &str, secs: i64) {
        let windows = self
            .users
            .entry(user_id.to_string())
            .or_default()
            .clone();
        windows.lock().cooldown_until = Some(Utc::now().timestamp_millis() + secs * 1000);
    }

    /// Forget a user's counters entirely.
    pub fn reset(&self, user_id: &str) {
        self.users.remove(user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn under_all_gates_everything_allowed() {
        let limiter = limiter();
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        for i in 0..10 {
            // One request every 2s stays under every gate
            let now = base + Duration::seconds(i * 2);
            assert!(limiter.check_at("u1", now).allowed, "request {} blocked", i);
        }
    }

    #[test]
    fn eleventh_burst_request_rejected() {
        let limiter = limiter();
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        for _ in 0..10 {
            assert!(limiter.check_at("u1", base).allowed);
        }
        let decision = limiter.check_at("u1", base + Duration::seconds(1));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some("BURST_LIMIT_EXCEEDED"));
        assert!(decision.reset_time.unwrap() <= 10);
    }

    #[test]
    fn minute_limit_at_exactly_n_plus_one() {
        let config = RateLimitConfig {
            burst_limit: 1000,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        for i in 0..60 {
            // Spread across the minute to stay under the burst gate
            let now = base + Duration::milliseconds(i * 900);
            assert!(limiter.check_at("u1", now).allowed, "request {} blocked", i);
        }
        let decision = limiter.check_at("u1", base + Duration::seconds(55));
        assert!(!decision.allowed);
        assert_eq!(decision.reason, Some("MINUTE_LIMIT_EXCEEDED"));
        assert!(decision.reset_time.unwrap() <= 60);
    }

    #[test]
    fn minute_bucket_resets() {
        let config = RateLimitConfig {
            requests_per_minute: 2,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 30).unwrap();
        assert!(limiter.check_at("u1", base).allowed);
        assert!(limiter
            .check_at("u1", base + Duration::seconds(5))
            .allowed);
        assert!(!limiter
            .check_at("u1", base + Duration::seconds(10))
            .allowed);
        // Next wall-clock minute: counter rolls over
        assert!(limiter
            .check_at("u1", base + Duration::seconds(40))
            .allowed);
    }

    #[test]
    fn burst_rejection_arms_cooldown() {
        let limiter = limiter();
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        for _ in 0..10 {
            limiter.check_at("u1", base);
        }
        assert_eq!(
            limiter.check_at("u1", base).reason,
            Some("BURST_LIMIT_EXCEEDED")
        );
        // Burst window has passed but the cooldown is still active
        let later = base + Duration::seconds(30);
        let decision = limiter.check_at("u1", later);
        assert_eq!(decision.reason, Some("COOLDOWN_ACTIVE"));
        // Cooldown expired
        let after = base + Duration::seconds(61);
        assert!(limiter.check_at("u1", after).allowed);
    }

    #[test]
    fn rejected_requests_record_nothing() {
        let config = RateLimitConfig {
            requests_per_minute: 1,
            ..Default::default()
        };
        let limiter = RateLimiter::new(config);
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(limiter.check_at("u1", base).allowed);
        for _ in 0..5 {
            assert!(!limiter.check_at("u1", base + Duration::seconds(1)).allowed);
        }
        // The rejections did not consume the next minute's allowance
        assert!(limiter
            .check_at("u1", base + Duration::seconds(61))
            .allowed);
    }

    #[test]
    fn users_are_isolated() {
        let limiter = limiter();
        let base = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        for _ in 0..10 {
            assert!(limiter.check_at("u1", base).allowed);
        }
        assert!(!limiter.check_at("u1", base).allowed);
        assert!(limiter.check_at("u2", base).allowed);
    }
}
