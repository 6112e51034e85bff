//! Threshold alerts over a [`HealthSnapshot`].

use super::HealthSnapshot;
use crate::config::HealthConfig;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertThresholds {
    /// Fraction of failed events over the last hour
    pub error_rate: f64,
    pub latency_ms: f64,
    pub queue_size: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            latency_ms: 5000.0,
            queue_size: 1000,
        }
    }
}

impl From<&HealthConfig> for AlertThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            error_rate: config.error_rate,
            latency_ms: config.latency_ms,
            queue_size: config.queue_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    HighErrorRate,
    HighLatency,
    QueueBacklog,
    ConnectorDown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl AlertThresholds {
    pub fn evaluate(&self, snapshot: &HealthSnapshot) -> Vec<Alert> {
        let mut alerts = Vec::new();

        let rate = snapshot.error_rate();
        if rate > self.error_rate {
            alerts.push(Alert {
                kind: AlertKind::HighErrorRate,
                message: format!(
                    "error rate {:.1}% exceeds {:.1}%",
                    rate * 100.0,
                    self.error_rate * 100.0
                ),
            });
        }

        if snapshot.average_latency_ms > self.latency_ms {
            alerts.push(Alert {
                kind: AlertKind::HighLatency,
                message: format!(
                    "average latency {:.0}ms exceeds {:.0}ms",
                    snapshot.average_latency_ms, self.latency_ms
                ),
            });
        }

        if snapshot.queue_size > self.queue_size {
            alerts.push(Alert {
                kind: AlertKind::QueueBacklog,
                message: format!(
                    "queue size {} exceeds {}",
                    snapshot.queue_size, self.queue_size
                ),
            });
        }

        for (up, name) in [
            (snapshot.system_a_connector_up, "system A"),
            (snapshot.system_b_connector_up, "system B"),
        ] {
            if !up {
                alerts.push(Alert {
                    kind: AlertKind::ConnectorDown,
                    message: format!("{name} connector is down"),
                });
            }
        }

        alerts
    }
}
