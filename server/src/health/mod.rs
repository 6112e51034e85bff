//! Metrics, health snapshots and alerting.

mod alerts;
mod metrics;
mod monitor;
mod snapshot;

pub use alerts::{Alert, AlertKind, AlertThresholds};
pub use metrics::{Counters, SyncMetrics};
pub use monitor::Monitor;
pub use snapshot::{HealthSnapshot, TableStats};
