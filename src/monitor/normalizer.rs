//! Sample normalizer
//!
//! Coerces whatever a collector or external agent reported into a canonical
//! [`TelemetryFrame`]. Collectors disagree on key names and units; the
//! dashboard relies on the invariants enforced here: percentages in
//! [0, 100], byte counts within the JS safe-integer range, a timestamp on
//! every frame, and `usedPercentage` recomputed from total/used.

use chrono::Utc;
use serde_json::Value;

use super::frame::{
    CpuStats, HostIdentity, NetworkStats, OsStats, StorageStats, TelemetryFrame,
};

/// Largest byte count representable losslessly in a JS number (2^53 - 1)
const MAX_SAFE_BYTES: u64 = (1u64 << 53) - 1;

/// Normalize a raw sample. Returns the host identity the frame belongs to
/// and the frame itself, or `None` when no host identifier is present.
pub fn normalize(raw: &Value, source: &str, session_id: Option<&str>) -> Option<(HostIdentity, TelemetryFrame)> {
    let identity = extract_identity(raw)?;

    let now_ms = Utc::now().timestamp_millis();
    let timestamp = raw
        .get("timestamp")
        .and_then(Value::as_i64)
        .filter(|ts| *ts > 0)
        .unwrap_or(now_ms);

    let frame = TelemetryFrame {
        cpu: normalize_cpu(raw.get("cpu")),
        memory: normalize_storage(raw.get("memory")),
        swap: normalize_storage(raw.get("swap")),
        disk: normalize_storage(raw.get("disk")),
        network: normalize_network(raw.get("network")),
        os: OsStats {
            hostname: identity.hostname.clone(),
        },
        timestamp,
        source: source.to_string(),
        session_id: session_id.map(str::to_string),
        last_updated: now_ms,
    };

    Some((identity, frame))
}

/// Host identifier precedence: `hostId`, `uniqueHostId`, `hostname`
/// (optionally paired with a reported `ip`), then `os.hostname`.
fn extract_identity(raw: &Value) -> Option<HostIdentity> {
    for key in ["hostId", "uniqueHostId"] {
        if let Some(id) = raw.get(key).and_then(Value::as_str) {
            if !id.trim().is_empty() {
                return Some(HostIdentity::parse(id));
            }
        }
    }

    let hostname = raw
        .get("hostname")
        .and_then(Value::as_str)
        .or_else(|| {
            raw.get("os")
                .and_then(|os| os.get("hostname"))
                .and_then(Value::as_str)
        })
        .map(str::trim)
        .filter(|s| !s.is_empty())?;

    let ip = raw
        .get("ip")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());

    Some(HostIdentity::from_parts(hostname, ip))
}

fn clamp_pct(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn clamp_bytes(v: &Value) -> u64 {
    let n = match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    };
    if !n.is_finite() || n <= 0.0 {
        0
    } else {
        (n as u64).min(MAX_SAFE_BYTES)
    }
}

fn field<'a>(obj: Option<&'a Value>, names: &[&str]) -> Option<&'a Value> {
    let obj = obj?;
    names.iter().find_map(|name| obj.get(*name))
}

fn normalize_cpu(raw: Option<&Value>) -> CpuStats {
    let usage = field(raw, &["usage", "usagePercentage", "percent"])
        .and_then(Value::as_f64)
        .map(clamp_pct)
        .unwrap_or(0.0);
    let cores = field(raw, &["cores", "count"])
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let model = field(raw, &["model"])
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    CpuStats { usage, cores, model }
}

fn normalize_storage(raw: Option<&Value>) -> StorageStats {
    let total = field(raw, &["total"]).map(clamp_bytes).unwrap_or(0);
    let mut used = field(raw, &["used"]).map(clamp_bytes).unwrap_or(0);
    let free = field(raw, &["free", "available"])
        .map(clamp_bytes)
        .unwrap_or_else(|| total.saturating_sub(used));

    if used == 0 && total > 0 && free > 0 {
        used = total.saturating_sub(free);
    }

    // usedPercentage is always derived, never trusted from the sample
    let used_percentage = if total > 0 {
        clamp_pct(used as f64 * 100.0 / total as f64)
    } else {
        0.0
    };

    StorageStats {
        total,
        used,
        free,
        used_percentage,
    }
}

fn normalize_network(raw: Option<&Value>) -> NetworkStats {
    let rx = field(raw, &["total_rx_speed", "rxSpeed", "rx"])
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0);
    let tx = field(raw, &["total_tx_speed", "txSpeed", "tx"])
        .and_then(Value::as_f64)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .unwrap_or(0.0);
    NetworkStats {
        total_rx_speed: rx,
        total_tx_speed: tx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fills_missing_timestamp() {
        let raw = json!({"hostId": "prod-1@1.2.3.4", "cpu": {"usage": 12.5}});
        let (_, frame) = normalize(&raw, "collector", None).unwrap();
        assert!(frame.timestamp > 0);
        assert!(frame.last_updated >= frame.timestamp);
    }

    #[test]
    fn recomputes_used_percentage() {
        let raw = json!({
            "hostId": "prod-1",
            "memory": {"total": 1000, "used": 250, "usedPercentage": 99.0},
        });
        let (_, frame) = normalize(&raw, "collector", None).unwrap();
        assert_eq!(frame.memory.used_percentage, 25.0);
    }

    #[test]
    fn zero_total_means_zero_percentage() {
        let raw = json!({"hostId": "prod-1", "memory": {"total": 0, "used": 5}});
        let (_, frame) = normalize(&raw, "collector", None).unwrap();
        assert_eq!(frame.memory.used_percentage, 0.0);
    }

    #[test]
    fn clamps_out_of_range_values() {
        let raw = json!({
            "hostId": "prod-1",
            "cpu": {"usage": 250.0, "cores": 8},
            "disk": {"total": 1e20, "used": 2e20},
        });
        let (_, frame) = normalize(&raw, "collector", None).unwrap();
        assert_eq!(frame.cpu.usage, 100.0);
        assert_eq!(frame.disk.total, super::MAX_SAFE_BYTES);
        assert!(frame.disk.used_percentage <= 100.0);
    }

    #[test]
    fn derives_used_from_free() {
        let raw = json!({"hostId": "prod-1", "memory": {"total": 100, "free": 40}});
        let (_, frame) = normalize(&raw, "collector", None).unwrap();
        assert_eq!(frame.memory.used, 60);
        assert_eq!(frame.memory.used_percentage, 60.0);
    }

    #[test]
    fn identity_fallbacks() {
        let raw = json!({"uniqueHostId": "db-1@10.0.0.2"});
        let (id, _) = normalize(&raw, "client", None).unwrap();
        assert_eq!(id.canonical(), "db-1@10.0.0.2");

        let raw = json!({"hostname": "db-1", "ip": "10.0.0.2", "cpu": {}});
        let (id, _) = normalize(&raw, "client", None).unwrap();
        assert_eq!(id.canonical(), "db-1@10.0.0.2");

        let raw = json!({"os": {"hostname": "db-1"}});
        let (id, _) = normalize(&raw, "client", None).unwrap();
        assert_eq!(id.canonical(), "db-1");

        assert!(normalize(&json!({"cpu": {}}), "client", None).is_none());
    }

    #[test]
    fn idempotent_on_normalized_output() {
        let raw = json!({
            "hostId": "prod-1@1.2.3.4",
            "cpu": {"usage": 42.0, "cores": 4, "model": "Xeon"},
            "memory": {"total": 1000, "used": 500, "free": 500},
            "timestamp": 1700000000000i64,
        });
        let (id, frame) = normalize(&raw, "collector", Some("s1")).unwrap();
        assert_eq!(id.canonical(), "prod-1@1.2.3.4");
        // A normalized frame re-ingested keeps its stats (host identity
        // collapses to the bare hostname, as frames only carry os.hostname)
        let reraw = serde_json::to_value(&frame).unwrap();
        let (_, frame2) = normalize(&reraw, "collector", Some("s1")).unwrap();
        assert_eq!(frame.cpu, frame2.cpu);
        assert_eq!(frame.memory, frame2.memory);
        assert_eq!(frame.timestamp, frame2.timestamp);
    }
}
