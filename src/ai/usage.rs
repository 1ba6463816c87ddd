//! Per-user AI usage accounting
//!
//! Totals plus per-day buckets with a 30-day retention sweep. Values only
//! ever grow within a day; retention trims whole days.

use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

/// Days of per-day history kept
const RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct TokenCounts {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DayUsage {
    pub requests: u64,
    pub tokens: TokenCounts,
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub total_requests: u64,
    pub total_tokens: TokenCounts,
    pub total_cost: f64,
    /// ISO date -> usage for that day
    pub daily: HashMap<String, DayUsage>,
}

#[derive(Debug, Default)]
struct UserUsage {
    total_requests: u64,
    total_tokens: TokenCounts,
    total_cost: f64,
    daily: HashMap<NaiveDate, DayUsage>,
}

#[derive(Default)]
pub struct UsageTracker {
    users: DashMap<String, Mutex<UserUsage>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed request.
    pub fn record(&self, user_id: &str, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.record_on(user_id, input_tokens, output_tokens, cost, Utc::now().date_naive());
    }

    fn record_on(
        &self,
        user_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
        day: NaiveDate,
    ) {
        let entry = self.users.entry(user_id.to_string()).or_default();
        let mut usage = entry.lock();

        usage.total_requests += 1;
        usage.total_tokens.input += input_tokens;
        usage.total_tokens.output += output_tokens;
        usage.total_cost += cost;

        let daily = usage.daily.entry(day).or_default();
        daily.requests += 1;
        daily.tokens.input += input_tokens;
        daily.tokens.output += output_tokens;
        daily.cost += cost;
    }

    pub fn snapshot(&self, user_id: &str) -> UsageSnapshot {
        let Some(entry) = self.users.get(user_id) else {
            return UsageSnapshot::default();
        };
        let usage = entry.lock();
        UsageSnapshot {
            total_requests: usage.total_requests,
            total_tokens: usage.total_tokens,
            total_cost: usage.total_cost,
            daily: usage
                .daily
                .iter()
                .map(|(day, value)| (day.format("%Y-%m-%d").to_string(), value.clone()))
                .collect(),
        }
    }

    /// Drop per-day buckets older than the retention window.
    pub fn sweep(&self) {
        let cutoff = Utc::now().date_naive() - chrono::Duration::days(RETENTION_DAYS);
        for entry in self.users.iter() {
            entry.value().lock().daily.retain(|day, _| *day >= cutoff);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_totals_and_daily() {
        let tracker = UsageTracker::new();
        let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        tracker.record_on("u1", 100, 50, 0.02, day);
        tracker.record_on("u1", 10, 5, 0.01, day);

        let snapshot = tracker.snapshot("u1");
        assert_eq!(snapshot.total_requests, 2);
        assert_eq!(snapshot.total_tokens.input, 110);
        assert_eq!(snapshot.total_tokens.output, 55);
        assert!((snapshot.total_cost - 0.03).abs() < 1e-9);
        assert_eq!(snapshot.daily["2025-06-01"].requests, 2);
    }

    #[test]
    fn sweep_trims_old_days_but_keeps_totals() {
        let tracker = UsageTracker::new();
        let old = Utc::now().date_naive() - chrono::Duration::days(RETENTION_DAYS + 10);
        tracker.record_on("u1", 100, 50, 0.02, old);
        tracker.record_on("u1", 1, 1, 0.0, Utc::now().date_naive());

        tracker.sweep();
        let snapshot = tracker.snapshot("u1");
        assert_eq!(snapshot.daily.len(), 1);
        assert_eq!(snapshot.total_requests, 2);
    }

    #[test]
    fn unknown_user_is_empty() {
        let tracker = UsageTracker::new();
        let snapshot = tracker.snapshot("nobody");
        assert_eq!(snapshot.total_requests, 0);
        assert!(snapshot.daily.is_empty());
    }
}
