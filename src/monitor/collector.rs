//! Inline telemetry collector
//!
//! One collector task per SSH session, sampling the remote host through exec
//! channels on the same connection. Lifetime is bound to the session: the
//! task selects on the connection's disconnect broadcast and never outlives
//! it. Subscriber presence is irrelevant here; `abort` frames do not reach
//! this module.
//!
//! Polling mode issues one probe per tick; streaming mode runs a single
//! long-lived remote loop emitting the same marker-delimited blocks and
//! parses them incrementally.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::ChannelMsg;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use super::frame::HostIdentity;
use super::hub::MonitorHub;
use crate::ssh::registry::SessionEntry;
use crate::ssh::SshError;

/// Default probe interval
const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Probe interval bounds
const MIN_INTERVAL: Duration = Duration::from_millis(500);
const MAX_INTERVAL: Duration = Duration::from_secs(10);

/// Per-probe command timeout
const COMMAND_TIMEOUT: Duration = Duration::from_secs(8);

/// Upper bound for accumulated probe output
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Consecutive probe failures tolerated before the collector stops
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// CPU load above which the probe interval widens
const HIGH_CPU_THRESHOLD: f64 = 80.0;

/// Progressive interval widening under high CPU: 1x -> 1.5x -> 2x
const BACKOFF_FACTORS: [f64; 3] = [1.0, 1.5, 2.0];

/// Errors that mean the SSH transport is gone, not just a flaky probe
static CONNECTION_ERROR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"SSH连接|Not connected|Unable to exec|Connection closed|ECONNRESET|ENOTFOUND|ETIMEDOUT")
        .expect("connection error regex")
});

/// Marker-delimited probe: one round trip collects everything the telemetry
/// frame needs. Every section tolerates absence (non-Linux or locked-down
/// hosts degrade to partial frames).
const SAMPLE_COMMAND: &str = concat!(
    "echo '===HOSTNAME==='; hostname 2>/dev/null; ",
    "echo '===STAT==='; head -1 /proc/stat 2>/dev/null; ",
    "echo '===MEMINFO==='; grep -E '^(MemTotal|MemAvailable|SwapTotal|SwapFree):' /proc/meminfo 2>/dev/null; ",
    "echo '===CPUINFO==='; grep -m1 'model name' /proc/cpuinfo 2>/dev/null; nproc 2>/dev/null; ",
    "echo '===DISK==='; df -kP / 2>/dev/null | tail -1; ",
    "echo '===NETDEV==='; cat /proc/net/dev 2>/dev/null; ",
    "echo '===END==='"
);

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub interval: Duration,
    /// Run one long-lived remote loop instead of per-tick probes
    pub streaming: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            streaming: false,
        }
    }
}

impl CollectorConfig {
    fn clamped_interval(&self) -> Duration {
        self.interval.clamp(MIN_INTERVAL, MAX_INTERVAL)
    }
}

/// Raw counters from one probe, kept for delta computation.
#[derive(Debug, Clone, Default)]
struct ProbeSnapshot {
    cpu_total: u64,
    cpu_active: u64,
    net_rx: u64,
    net_tx: u64,
    timestamp_ms: i64,
}

/// Spawn the collector for a freshly opened session.
pub fn spawn(entry: Arc<SessionEntry>, hub: Arc<MonitorHub>) {
    spawn_with_config(entry, hub, CollectorConfig::default());
}

pub fn spawn_with_config(entry: Arc<SessionEntry>, hub: Arc<MonitorHub>, config: CollectorConfig) {
    tokio::spawn(async move {
        let mut disconnect_rx = entry.controller.subscribe_disconnect();
        let connection_id = entry.connection_id.clone();

        info!(
            "Collector started for session {} ({}, {:?} interval{})",
            connection_id,
            entry.host,
            config.clamped_interval(),
            if config.streaming { ", streaming" } else { "" }
        );

        let result = if config.streaming {
            streaming_loop(&entry, &hub, &config, &mut disconnect_rx).await
        } else {
            polling_loop(&entry, &hub, &config, &mut disconnect_rx).await
        };

        match result {
            CollectorExit::SessionClosed => {
                debug!("Collector for session {} stopped with session", connection_id)
            }
            CollectorExit::ConnectionError(message) => {
                warn!(
                    "Collector for session {} hit connection error: {}",
                    connection_id, message
                );
                let identity =
                    HostIdentity::from_parts(&entry.host, entry.ip.as_deref());
                hub.collector_disconnected(&identity, &connection_id);
            }
            CollectorExit::TooManyFailures => {
                warn!(
                    "Collector for session {} stopped after {} consecutive failures",
                    connection_id, MAX_CONSECUTIVE_FAILURES
                );
            }
        }
    });
}

enum CollectorExit {
    SessionClosed,
    ConnectionError(String),
    TooManyFailures,
}

async fn polling_loop(
    entry: &SessionEntry,
    hub: &MonitorHub,
    config: &CollectorConfig,
    disconnect_rx: &mut tokio::sync::broadcast::Receiver<()>,
) -> CollectorExit {
    let base_interval = config.clamped_interval();
    let mut backoff_level: usize = 0;
    let mut prev: Option<ProbeSnapshot> = None;
    let mut consecutive_failures: u32 = 0;

    loop {
        let factor = BACKOFF_FACTORS[backoff_level];
        let sleep = base_interval.mul_f64(factor);

        tokio::select! {
            _ = disconnect_rx.recv() => return CollectorExit::SessionClosed,
            _ = tokio::time::sleep(sleep) => {}
        }

        match run_probe(entry).await {
            Ok(output) => {
                consecutive_failures = 0;
                match build_sample(entry, &output, &mut prev) {
                    Some((cpu_usage, raw)) => {
                        hub.ingest(&raw, "collector", Some(&entry.connection_id));
                        backoff_level = next_backoff_level(backoff_level, cpu_usage);
                    }
                    None => {
                        trace!(
                            "Probe output unusable for session {}",
                            entry.connection_id
                        );
                    }
                }
            }
            Err(e) => {
                let message = e.to_string();
                if CONNECTION_ERROR_RE.is_match(&message) {
                    return CollectorExit::ConnectionError(message);
                }
                consecutive_failures += 1;
                debug!(
                    "Probe failed for session {} ({}/{}): {}",
                    entry.connection_id, consecutive_failures, MAX_CONSECUTIVE_FAILURES, message
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    return CollectorExit::TooManyFailures;
                }
            }
        }
    }
}

/// Streaming mode: the remote emits marker blocks in a loop over a single
/// channel; blocks are parsed as they complete.
async fn streaming_loop(
    entry: &SessionEntry,
    hub: &MonitorHub,
    config: &CollectorConfig,
    disconnect_rx: &mut tokio::sync::broadcast::Receiver<()>,
) -> CollectorExit {
    let interval_secs = config.clamped_interval().as_secs_f64().max(0.5);
    let command = format!(
        "while :; do {}; sleep {:.1}; done",
        SAMPLE_COMMAND, interval_secs
    );

    let mut channel = match entry.controller.open_session_channel().await {
        Ok(channel) => channel,
        Err(e) => return CollectorExit::ConnectionError(e.to_string()),
    };
    if let Err(e) = channel.exec(true, command.as_str()).await {
        return CollectorExit::ConnectionError(format!("Unable to exec: {}", e));
    }

    let mut buffer = String::new();
    let mut prev: Option<ProbeSnapshot> = None;

    loop {
        tokio::select! {
            _ = disconnect_rx.recv() => {
                let _ = channel.eof().await;
                return CollectorExit::SessionClosed;
            }
            msg = channel.wait() => {
                match msg {
                    Some(ChannelMsg::Data { data }) => {
                        buffer.push_str(&String::from_utf8_lossy(&data));
                        if buffer.len() > MAX_OUTPUT_SIZE {
                            let excess = buffer.len() - MAX_OUTPUT_SIZE;
                            buffer.drain(..excess);
                        }
                        // An installed agent emits newline-delimited JSON
                        // frames; those go straight to the normalizer.
                        while let Some(newline) = buffer.find('\n') {
                            if !buffer[..newline].trim_start().starts_with('{') {
                                break;
                            }
                            let line: String = buffer.drain(..=newline).collect();
                            if let Ok(raw) = serde_json::from_str::<Value>(line.trim()) {
                                hub.ingest(&raw, "collector", Some(&entry.connection_id));
                            }
                        }
                        // Shell fallback: marker-delimited probe blocks
                        while let Some(end) = buffer.find("===END===") {
                            let block: String = buffer.drain(..end + "===END===".len()).collect();
                            if let Some((_, raw)) = build_sample(entry, &block, &mut prev) {
                                hub.ingest(&raw, "collector", Some(&entry.connection_id));
                            }
                        }
                    }
                    Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => {
                        return CollectorExit::ConnectionError("Connection closed".into());
                    }
                    Some(_) => {}
                }
            }
        }
    }
}

/// Execute one probe over a fresh exec channel.
async fn run_probe(entry: &SessionEntry) -> Result<String, SshError> {
    let mut channel = entry.controller.open_session_channel().await?;
    channel
        .exec(true, SAMPLE_COMMAND)
        .await
        .map_err(|e| SshError::ChannelError(format!("Unable to exec: {}", e)))?;

    let collect = async {
        let mut output = String::new();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    output.push_str(&String::from_utf8_lossy(&data));
                    if output.len() > MAX_OUTPUT_SIZE {
                        break;
                    }
                }
                ChannelMsg::Eof | ChannelMsg::Close => break,
                _ => {}
            }
        }
        output
    };

    timeout(COMMAND_TIMEOUT, collect)
        .await
        .map_err(|_| SshError::Timeout("probe timed out (ETIMEDOUT)".into()))
}

fn next_backoff_level(current: usize, cpu_usage: f64) -> usize {
    if cpu_usage > HIGH_CPU_THRESHOLD {
        (current + 1).min(BACKOFF_FACTORS.len() - 1)
    } else {
        0
    }
}

/// Parse probe output into the raw sample shape `/monitor-client` agents
/// send, so both ingress paths share the normalizer. Returns the reported
/// CPU usage alongside for the adaptive interval.
fn build_sample(
    entry: &SessionEntry,
    output: &str,
    prev: &mut Option<ProbeSnapshot>,
) -> Option<(f64, Value)> {
    let sections = split_sections(output);
    let now_ms = Utc::now().timestamp_millis();

    let hostname = sections
        .get("HOSTNAME")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| entry.host.clone());

    let (cpu_total, cpu_active) = parse_proc_stat(sections.get("STAT").copied())?;
    let meminfo = parse_meminfo(sections.get("MEMINFO").copied());
    let (cpu_model, cpu_cores) = parse_cpuinfo(sections.get("CPUINFO").copied());
    let disk = parse_df(sections.get("DISK").copied());
    let (net_rx, net_tx) = parse_netdev(sections.get("NETDEV").copied());

    let snapshot = ProbeSnapshot {
        cpu_total,
        cpu_active,
        net_rx,
        net_tx,
        timestamp_ms: now_ms,
    };

    // CPU% and network rates need a delta; the first probe establishes the
    // baseline and reports zeros.
    let (cpu_usage, rx_speed, tx_speed) = match prev.as_ref() {
        Some(p) => {
            let total_delta = snapshot.cpu_total.saturating_sub(p.cpu_total);
            let active_delta = snapshot.cpu_active.saturating_sub(p.cpu_active);
            let usage = if total_delta > 0 {
                active_delta as f64 * 100.0 / total_delta as f64
            } else {
                0.0
            };
            let dt = (snapshot.timestamp_ms - p.timestamp_ms) as f64 / 1000.0;
            let (rx, tx) = if dt > 0.0 {
                (
                    snapshot.net_rx.saturating_sub(p.net_rx) as f64 / dt,
                    snapshot.net_tx.saturating_sub(p.net_tx) as f64 / dt,
                )
            } else {
                (0.0, 0.0)
            };
            (usage, rx, tx)
        }
        None => (0.0, 0.0, 0.0),
    };
    *prev = Some(snapshot);

    let (mem_total, mem_available, swap_total, swap_free) = meminfo;
    let mem_used = mem_total.saturating_sub(mem_available);
    let swap_used = swap_total.saturating_sub(swap_free);
    let host_id = match entry.ip.as_deref() {
        Some(ip) if ip != hostname => format!("{}@{}", hostname, ip),
        _ => hostname.clone(),
    };

    let raw = json!({
        "hostId": host_id,
        "cpu": {"usage": cpu_usage, "cores": cpu_cores, "model": cpu_model},
        "memory": {"total": mem_total, "used": mem_used, "free": mem_available},
        "swap": {"total": swap_total, "used": swap_used, "free": swap_free},
        "disk": disk,
        "network": {"total_rx_speed": rx_speed, "total_tx_speed": tx_speed},
        "os": {"hostname": hostname},
        "timestamp": now_ms,
    });

    Some((cpu_usage, raw))
}

fn split_sections(output: &str) -> std::collections::HashMap<&str, &str> {
    let mut sections = std::collections::HashMap::new();
    let mut rest = output;
    while let Some(start) = rest.find("===") {
        let after = &rest[start + 3..];
        let Some(name_end) = after.find("===") else { break };
        let name = &after[..name_end];
        let body_start = &after[name_end + 3..];
        let body_end = body_start.find("===").unwrap_or(body_start.len());
        if name != "END" {
            sections.insert(name, body_start[..body_end].trim_matches('\n'));
        }
        rest = &body_start[body_end..];
    }
    sections
}

/// `cpu  user nice system idle iowait irq softirq steal ...`
fn parse_proc_stat(section: Option<&str>) -> Option<(u64, u64)> {
    let line = section?.lines().find(|l| l.starts_with("cpu"))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some((total, total.saturating_sub(idle)))
}

/// Returns (mem_total, mem_available, swap_total, swap_free) in bytes.
fn parse_meminfo(section: Option<&str>) -> (u64, u64, u64, u64) {
    let mut values = [0u64; 4];
    if let Some(section) = section {
        for line in section.lines() {
            let mut parts = line.split_whitespace();
            let key = parts.next().unwrap_or("");
            let kib: u64 = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            let bytes = kib * 1024;
            match key {
                "MemTotal:" => values[0] = bytes,
                "MemAvailable:" => values[1] = bytes,
                "SwapTotal:" => values[2] = bytes,
                "SwapFree:" => values[3] = bytes,
                _ => {}
            }
        }
    }
    (values[0], values[1], values[2], values[3])
}

/// Returns (model, cores).
fn parse_cpuinfo(section: Option<&str>) -> (String, u32) {
    let mut model = String::new();
    let mut cores = 0u32;
    if let Some(section) = section {
        for line in section.lines() {
            if let Some((_, value)) = line.split_once(':') {
                if model.is_empty() {
                    model = value.trim().to_string();
                }
            } else if let Ok(n) = line.trim().parse::<u32>() {
                cores = n;
            }
        }
    }
    (model, cores)
}

/// `df -kP /` data line: fs, 1024-blocks, used, available, pct, mount
fn parse_df(section: Option<&str>) -> Value {
    let Some(line) = section.and_then(|s| s.lines().last()) else {
        return json!({"total": 0, "used": 0, "free": 0});
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return json!({"total": 0, "used": 0, "free": 0});
    }
    let kib = |s: &str| s.parse::<u64>().unwrap_or(0) * 1024;
    json!({
        "total": kib(fields[1]),
        "used": kib(fields[2]),
        "free": kib(fields[3]),
    })
}

/// Sum rx/tx byte counters across interfaces, skipping loopback.
fn parse_netdev(section: Option<&str>) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    if let Some(section) = section {
        for line in section.lines() {
            let Some((name, counters)) = line.split_once(':') else {
                continue;
            };
            if name.trim() == "lo" {
                continue;
            }
            let fields: Vec<u64> = counters
                .split_whitespace()
                .filter_map(|f| f.parse().ok())
                .collect();
            if fields.len() >= 9 {
                rx = rx.saturating_add(fields[0]);
                tx = tx.saturating_add(fields[8]);
            }
        }
    }
    (rx, tx)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROBE_OUTPUT: &str = "===HOSTNAME===\nprod-1\n===STAT===\ncpu  100 0 100 700 100 0 0 0\n===MEMINFO===\nMemTotal:       1000 kB\nMemAvailable:    400 kB\nSwapTotal:       500 kB\nSwapFree:        500 kB\n===CPUINFO===\nmodel name\t: Xeon E5\n4\n===DISK===\n/dev/sda1 1000 250 750 25% /\n===NETDEV===\n  lo: 999 0 0 0 0 0 0 0 999 0 0 0 0 0 0 0\n  eth0: 1000 0 0 0 0 0 0 0 2000 0 0 0 0 0 0 0\n===END===\n";

    #[test]
    fn splits_marker_sections() {
        let sections = split_sections(PROBE_OUTPUT);
        assert_eq!(sections.get("HOSTNAME").copied(), Some("prod-1"));
        assert!(sections.get("STAT").unwrap().starts_with("cpu "));
        assert!(!sections.contains_key("END"));
    }

    #[test]
    fn parses_proc_stat() {
        let (total, active) = parse_proc_stat(Some("cpu  100 0 100 700 100 0 0 0")).unwrap();
        assert_eq!(total, 1000);
        assert_eq!(active, 200);
        assert!(parse_proc_stat(Some("garbage")).is_none());
    }

    #[test]
    fn parses_meminfo_to_bytes() {
        let (mt, ma, st, sf) = parse_meminfo(Some(
            "MemTotal: 1000 kB\nMemAvailable: 400 kB\nSwapTotal: 500 kB\nSwapFree: 300 kB",
        ));
        assert_eq!(mt, 1_024_000);
        assert_eq!(ma, 409_600);
        assert_eq!(st, 512_000);
        assert_eq!(sf, 307_200);
    }

    #[test]
    fn parses_df_line() {
        let disk = parse_df(Some("/dev/sda1 1000 250 750 25% /"));
        assert_eq!(disk["total"], 1_024_000);
        assert_eq!(disk["used"], 256_000);
        assert_eq!(disk["free"], 768_000);
    }

    #[test]
    fn netdev_skips_loopback() {
        let (rx, tx) = parse_netdev(Some(
            "  lo: 999 0 0 0 0 0 0 0 999 0 0 0 0 0 0 0\n  eth0: 1000 0 0 0 0 0 0 0 2000 0 0 0 0 0 0 0",
        ));
        assert_eq!(rx, 1000);
        assert_eq!(tx, 2000);
    }

    #[test]
    fn backoff_escalates_then_recovers() {
        let mut level = 0;
        level = next_backoff_level(level, 90.0);
        assert_eq!(BACKOFF_FACTORS[level], 1.5);
        level = next_backoff_level(level, 95.0);
        assert_eq!(BACKOFF_FACTORS[level], 2.0);
        level = next_backoff_level(level, 99.0);
        assert_eq!(BACKOFF_FACTORS[level], 2.0);
        level = next_backoff_level(level, 10.0);
        assert_eq!(BACKOFF_FACTORS[level], 1.0);
    }

    #[test]
    fn connection_error_patterns() {
        for message in [
            "SSH连接失败",
            "Not connected",
            "Unable to exec: channel closed",
            "Connection closed",
            "read ECONNRESET",
            "getaddrinfo ENOTFOUND",
            "probe timed out (ETIMEDOUT)",
        ] {
            assert!(CONNECTION_ERROR_RE.is_match(message), "missed {}", message);
        }
        assert!(!CONNECTION_ERROR_RE.is_match("permission denied"));
    }

    #[test]
    fn delta_cpu_and_network() {
        use crate::ssh::handle_owner::HandleController;
        use tokio::sync::mpsc;

        let (tx, _rx) = mpsc::channel(1);
        let entry = SessionEntry::new(
            "c1".into(),
            "u1".into(),
            "prod-1".into(),
            Some("1.2.3.4".into()),
            22,
            "alice".into(),
            HandleController::new(tx),
        );

        let mut prev = None;
        let (cpu0, raw0) = build_sample(&entry, PROBE_OUTPUT, &mut prev).unwrap();
        assert_eq!(cpu0, 0.0);
        assert_eq!(raw0["hostId"], "prod-1@1.2.3.4");
        assert_eq!(raw0["memory"]["total"], 1_024_000u64);

        // Second probe: +100 active of +200 total jiffies -> 50%
        let second = PROBE_OUTPUT.replace(
            "cpu  100 0 100 700 100 0 0 0",
            "cpu  200 0 100 800 100 0 0 0",
        );
        let baseline = prev.clone().unwrap();
        let (cpu1, raw1) = build_sample(&entry, &second, &mut prev).unwrap();
        assert!(prev.as_ref().unwrap().timestamp_ms >= baseline.timestamp_ms);
        assert!((cpu1 - 50.0).abs() < 0.01, "cpu was {}", cpu1);
        assert_eq!(raw1["cpu"]["usage"], cpu1);
    }
}
