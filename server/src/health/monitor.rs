//! Background connectivity checks and alert logging.

use super::{AlertThresholds, SyncMetrics};
use crate::db::Stores;
use crate::shutdown;
use rowsync_engine::System;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct Monitor {
    stores: Stores,
    metrics: Arc<SyncMetrics>,
    thresholds: AlertThresholds,
    data_dir: PathBuf,
}

impl Monitor {
    pub fn new(
        stores: Stores,
        metrics: Arc<SyncMetrics>,
        thresholds: AlertThresholds,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            stores,
            metrics,
            thresholds,
            data_dir,
        }
    }

    /// Ping both stores and refresh their up/down flags.
    pub async fn check_stores(&self) {
        let (a, b) = futures::future::join(self.stores.a.ping(), self.stores.b.ping()).await;
        for (system, pinged) in [(System::A, a), (System::B, b)] {
            let up = match pinged {
                Ok(()) => true,
                Err(e) => {
                    warn!(system = %system, error = %e, "Store unreachable");
                    false
                }
            };
            if up != self.metrics.store_up(system) {
                info!(system = %system, up, "Store connectivity changed");
            }
            self.metrics.set_store_up(system, up);
        }
    }

    /// One monitoring pass; returns the number of alerts raised.
    pub async fn tick(&self) -> usize {
        self.check_stores().await;

        let snapshot = match self.metrics.snapshot(&self.data_dir) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Cannot collect health snapshot");
                return 0;
            }
        };

        let alerts = self.thresholds.evaluate(&snapshot);
        for alert in &alerts {
            warn!(kind = ?alert.kind, "{}", alert);
        }
        debug!(
            success = snapshot.success_count,
            errors = snapshot.error_count,
            queue = snapshot.queue_size,
            "Health check"
        );
        alerts.len()
    }

    /// Run until shutdown, checking every `interval`.
    pub async fn run(self, interval: Duration, shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        let stopped = shutdown::wait(shutdown);
        tokio::pin!(stopped);

        loop {
            tokio::select! {
                _ = &mut stopped => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
        debug!("Health monitor stopped");
    }
}
