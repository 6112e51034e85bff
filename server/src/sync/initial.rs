//! Initial bulk load.
//!
//! Every source row of a mapping is pushed through the dispatcher as a
//! snapshot-read event, page by page in primary key order.

use super::{Dispatcher, Disposition};
use crate::error::Result;
use chrono::Utc;
use rowsync_engine::{ChangeEvent, ColumnName, TableMapping};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSyncReport {
    pub tables: usize,
    pub rows: u64,
    pub applied: u64,
    pub denied: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl InitialSyncReport {
    fn record(&mut self, disposition: &Disposition) {
        self.rows += 1;
        match disposition {
            Disposition::Applied => self.applied += 1,
            Disposition::Denied => self.denied += 1,
            Disposition::Failed(_) => self.failed += 1,
            Disposition::Skipped | Disposition::LoopDiscarded => self.skipped += 1,
        }
    }
}

/// Load each mapping's source table into its target.
///
/// Stops early, keeping what was already written, when `shutdown` flips.
/// A transport error aborts the load.
pub async fn initial_sync<'a>(
    dispatcher: &Dispatcher,
    mappings: impl IntoIterator<Item = &'a TableMapping>,
    batch_size: usize,
    shutdown: &watch::Receiver<bool>,
) -> Result<InitialSyncReport> {
    let batch_size = batch_size.max(1);
    let mut report = InitialSyncReport::default();

    for mapping in mappings {
        if *shutdown.borrow() {
            warn!("Initial sync interrupted");
            break;
        }
        report.tables += 1;

        let system = mapping.source.system;
        let source_name = dispatcher.registry().names().canonical(system).to_string();
        let store = dispatcher.stores().get(system);
        let columns = source_columns(mapping);
        let order_by = source_key(mapping);

        info!(mapping = %mapping, batch_size, "Initial sync of table");
        let mut offset = 0usize;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let page = store
                .scan(&mapping.source.table, &columns, &order_by, batch_size, offset)
                .await?;
            let fetched = page.len();

            for row in page {
                let event = ChangeEvent::snapshot(
                    source_name.as_str(),
                    mapping.source.table.as_str(),
                    row,
                    Utc::now().timestamp_millis(),
                );
                let disposition = dispatcher.process(&event).await?;
                report.record(&disposition);
            }

            if fetched < batch_size {
                break;
            }
            offset += fetched;
        }
    }

    info!(
        tables = report.tables,
        rows = report.rows,
        applied = report.applied,
        denied = report.denied,
        failed = report.failed,
        "Initial sync finished"
    );
    Ok(report)
}

fn source_columns(mapping: &TableMapping) -> Vec<ColumnName> {
    mapping
        .source
        .columns
        .iter()
        .filter(|c| !mapping.skip_columns.contains(&c.source))
        .map(|c| c.source.clone())
        .collect()
}

/// Source-side names of the primary key columns.
fn source_key(mapping: &TableMapping) -> Vec<ColumnName> {
    mapping
        .primary_key
        .iter()
        .filter_map(|target| {
            mapping
                .source
                .columns
                .iter()
                .find(|c| &c.target == target)
                .map(|c| c.source.clone())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_engine::{SemanticType, System};

    #[test]
    fn scan_uses_source_names() {
        let mapping = TableMapping::new(System::A, "users", "users")
            .column("user_id", "id", SemanticType::Integer)
            .column("email", "email", SemanticType::Text)
            .column("legacy_flags", "legacy_flags", SemanticType::Integer)
            .skip("legacy_flags");

        assert_eq!(source_columns(&mapping), vec!["user_id", "email"]);
        assert_eq!(source_key(&mapping), vec!["user_id"]);
    }
}
