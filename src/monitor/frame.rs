//! Telemetry frame model
//!
//! Wire shape mirrors what the browser dashboard consumes: camelCase keys
//! except the network speed fields, which collectors report snake_case.

use serde::{Deserialize, Serialize};

/// Canonical identity of a monitored host: `hostname@ip`.
///
/// Collectors report the combined form; subscribers may use either half.
/// Both halves are kept verbatim, never canonicalized away.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostIdentity {
    pub hostname: String,
    pub ip: Option<String>,
}

impl HostIdentity {
    /// Parse `hostname@ip`, a bare hostname, or a bare IP.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        match raw.split_once('@') {
            Some((hostname, ip)) if !hostname.is_empty() && !ip.is_empty() => Self {
                hostname: hostname.to_string(),
                ip: Some(ip.to_string()),
            },
            _ => Self {
                hostname: raw.to_string(),
                ip: None,
            },
        }
    }

    pub fn from_parts(hostname: &str, ip: Option<&str>) -> Self {
        Self {
            hostname: hostname.to_string(),
            ip: ip.map(str::to_string),
        }
    }

    /// Canonical form: `hostname@ip` when the IP is known, else the hostname.
    pub fn canonical(&self) -> String {
        match &self.ip {
            Some(ip) => format!("{}@{}", self.hostname, ip),
            None => self.hostname.clone(),
        }
    }

    /// Every string a subscriber may use to refer to this host.
    pub fn descriptors(&self) -> Vec<String> {
        let mut out = vec![self.hostname.clone()];
        if let Some(ip) = &self.ip {
            out.push(ip.clone());
            out.push(self.canonical());
        }
        out.dedup();
        out
    }
}

impl std::fmt::Display for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuStats {
    /// Usage percentage, clamped to [0, 100]
    pub usage: f64,
    pub cores: u32,
    #[serde(default)]
    pub model: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    /// Bytes
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Recomputed from total/used on normalization, clamped to [0, 100]
    pub used_percentage: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NetworkStats {
    /// Bytes per second
    pub total_rx_speed: f64,
    pub total_tx_speed: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OsStats {
    #[serde(default)]
    pub hostname: String,
}

/// One normalized telemetry sample for a host. Replaces any prior frame for
/// the same host id in the cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryFrame {
    pub cpu: CpuStats,
    pub memory: StorageStats,
    pub swap: StorageStats,
    pub disk: StorageStats,
    pub network: NetworkStats,
    pub os: OsStats,
    /// Sample time, ms since epoch; filled with receive time when missing
    pub timestamp: i64,
    /// Where the sample came from: `collector` or `monitor-client`
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Cache write time, ms since epoch
    pub last_updated: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_host_id() {
        let id = HostIdentity::parse("prod-1@1.2.3.4");
        assert_eq!(id.hostname, "prod-1");
        assert_eq!(id.ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(id.canonical(), "prod-1@1.2.3.4");
        assert_eq!(
            id.descriptors(),
            vec!["prod-1", "1.2.3.4", "prod-1@1.2.3.4"]
        );
    }

    #[test]
    fn parses_bare_forms() {
        let id = HostIdentity::parse("prod-1");
        assert_eq!(id.canonical(), "prod-1");
        assert_eq!(id.descriptors(), vec!["prod-1"]);

        let id = HostIdentity::parse("@1.2.3.4");
        assert_eq!(id.hostname, "@1.2.3.4");
        assert!(id.ip.is_none());
    }

    #[test]
    fn network_fields_stay_snake_case() {
        let frame = TelemetryFrame::default();
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value["network"].get("total_rx_speed").is_some());
        assert!(value["memory"].get("usedPercentage").is_some());
        assert!(value.get("lastUpdated").is_some());
    }
}
