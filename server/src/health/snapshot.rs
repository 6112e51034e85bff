//! The health snapshot contract consumed by external monitors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub applied: u64,
    pub errors: u64,
    pub skipped: u64,
    pub denied: u64,
}

/// Point-in-time service health.
///
/// `errorCount` and `successCount` cover the last hour; the other counters
/// are totals since start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub system_a_connector_up: bool,
    pub system_b_connector_up: bool,
    pub feed_connected: bool,
    pub error_count: u64,
    pub success_count: u64,
    pub skipped_count: u64,
    pub denied_count: u64,
    pub loop_discard_count: u64,
    pub fail_open_count: u64,
    pub queue_size: u64,
    pub average_latency_ms: f64,
    pub memory_usage_bytes: u64,
    pub disk_usage_percent: f64,
    pub tables: BTreeMap<String, TableStats>,
}

impl HealthSnapshot {
    /// Errors as a fraction of processed events over the last hour.
    pub fn error_rate(&self) -> f64 {
        let total = self.error_count + self.success_count;
        if total == 0 {
            0.0
        } else {
            self.error_count as f64 / total as f64
        }
    }
}

/// Resident set size of this process, or 0 where it cannot be read.
pub(crate) fn resident_memory_bytes() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map(|kb| kb * 1024)
        .unwrap_or(0)
}

/// Used space on the filesystem holding `path`, in percent.
pub(crate) fn disk_usage_percent(path: &Path) -> std::io::Result<f64> {
    let total = fs2::total_space(path)?;
    if total == 0 {
        return Ok(0.0);
    }
    let available = fs2::available_space(path)?;
    Ok((total.saturating_sub(available)) as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> HealthSnapshot {
        HealthSnapshot {
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            system_a_connector_up: true,
            system_b_connector_up: false,
            feed_connected: true,
            error_count: 1,
            success_count: 3,
            skipped_count: 0,
            denied_count: 0,
            loop_discard_count: 0,
            fail_open_count: 0,
            queue_size: 7,
            average_latency_ms: 1.5,
            memory_usage_bytes: 0,
            disk_usage_percent: 42.0,
            tables: BTreeMap::new(),
        }
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["systemAConnectorUp"], true);
        assert_eq!(json["systemBConnectorUp"], false);
        assert_eq!(json["queueSize"], 7);
        assert_eq!(json["averageLatencyMs"], 1.5);
        assert_eq!(json["diskUsagePercent"], 42.0);
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20Z");
    }

    #[test]
    fn error_rate() {
        assert_eq!(snapshot().error_rate(), 0.25);
        let idle = HealthSnapshot {
            error_count: 0,
            success_count: 0,
            ..snapshot()
        };
        assert_eq!(idle.error_rate(), 0.0);
    }

    #[test]
    fn disk_usage_of_working_directory() {
        let percent = disk_usage_percent(Path::new(".")).unwrap();
        assert!((0.0..=100.0).contains(&percent));
    }
}
