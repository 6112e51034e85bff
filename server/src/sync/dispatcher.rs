//! The per-event sync pipeline.
//!
//! guard -> lookup -> map -> probe -> decide -> apply -> publish

use crate::db::{self, Stores};
use crate::error::Result;
use crate::health::SyncMetrics;
use crate::publish::OutcomePublisher;
use chrono::Utc;
use rowsync_engine::{
    map_event, needs_target_state, ChangeEvent, ColumnName, Decision, Direction, LoopGuard,
    MappedRow, MappingRegistry, ResolveContext, ResolverRegistry, Row, Strategy, StrategyKind,
    SyncOutcomeEvent, WriteKind,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How an event left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Conflict resolution kept the target row
    Denied,
    /// No mapping for the table
    Skipped,
    /// An echo of our own write
    LoopDiscarded,
    /// Mapping or resolution error; terminal for this event
    Failed(String),
}

pub struct Dispatcher {
    registry: Arc<MappingRegistry>,
    resolvers: Arc<ResolverRegistry>,
    stores: Stores,
    publisher: Arc<dyn OutcomePublisher>,
    metrics: Arc<SyncMetrics>,
    guard: LoopGuard,
    default_strategy: StrategyKind,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<MappingRegistry>,
        resolvers: Arc<ResolverRegistry>,
        stores: Stores,
        publisher: Arc<dyn OutcomePublisher>,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        Self {
            registry,
            resolvers,
            stores,
            publisher,
            metrics,
            guard: LoopGuard::new("db-sync-service"),
            default_strategy: StrategyKind::Timestamp,
        }
    }

    pub fn with_loop_guard(mut self, guard: LoopGuard) -> Self {
        self.guard = guard;
        self
    }

    /// Strategy for mappings that declare none.
    pub fn with_default_strategy(mut self, strategy: StrategyKind) -> Self {
        self.default_strategy = strategy;
        self
    }

    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn metrics(&self) -> &Arc<SyncMetrics> {
        &self.metrics
    }

    /// Run one event through the pipeline.
    ///
    /// `Err` means the target store could not be reached while writing; the
    /// event must be delivered again. Every other outcome is final.
    pub async fn process(&self, event: &ChangeEvent) -> Result<Disposition> {
        let started = Instant::now();
        let table = event.source_table.as_str();
        let system = self.stats_system(event);

        if self.guard.is_own(event) {
            debug!(
                table,
                provenance = event.provenance_id.as_deref().unwrap_or(""),
                "Discarding echo of own write"
            );
            self.metrics.record_loop_discard();
            return Ok(Disposition::LoopDiscarded);
        }

        let Some(mapping) = self.registry.get_mapping(&event.source_system, table) else {
            warn!(system = %event.source_system, table, "No mapping for table, skipping");
            self.metrics.record_skipped(system, table);
            return Ok(Disposition::Skipped);
        };
        let direction = mapping.direction();

        let mapped = match map_event(event, mapping, direction, self.registry.lookups()) {
            Ok(mapped) => mapped,
            Err(e) => return Ok(self.fail(event, direction, None, e.to_string()).await),
        };
        let strategy = match mapping.strategy(self.default_strategy) {
            Ok(strategy) => strategy,
            Err(e) => {
                return Ok(self
                    .fail(event, direction, Some(&mapped), e.to_string())
                    .await)
            }
        };

        let store = self.stores.get(direction.target());
        let target_table = mapping.target.table.as_str();

        let decision = if needs_target_state(event.operation) {
            let columns = probe_columns(&strategy, &mapped);
            match store.fetch(target_table, &mapped.key, &columns).await {
                Ok(current) => self.decide(event, direction, &mapped, current.as_ref(), &strategy),
                Err(e) => {
                    warn!(
                        table = target_table,
                        key = %mapped.key,
                        error = %e,
                        fail_open = true,
                        "Conflict check failed, applying without it"
                    );
                    self.metrics.record_fail_open();
                    Ok(Decision::fail_open(event.operation))
                }
            }
        } else {
            self.decide(event, direction, &mapped, None, &strategy)
        };

        let approval = match decision {
            Ok(Decision::Approve(approval)) => approval,
            Ok(Decision::Deny(denial)) => {
                debug!(table, key = %mapped.key, reason = ?denial, "Conflict resolution kept target row");
                self.metrics.record_denied(system, table);
                return Ok(Disposition::Denied);
            }
            Err(e) => {
                return Ok(self
                    .fail(event, direction, Some(&mapped), e.to_string())
                    .await)
            }
        };

        if approval.reclassified {
            debug!(table, key = %mapped.key, "Create for existing row applied as update");
        }

        let MappedRow { mut values, key } = mapped;
        if approval.write != WriteKind::Delete {
            if let Some(marker) = self.guard.marker_column() {
                let stamp = self.guard.provenance_id(Uuid::new_v4());
                values.insert(marker.to_string(), Value::String(stamp));
            }
        }

        let written = db::apply(
            store.as_ref(),
            target_table,
            approval.write,
            &values,
            &key,
            approval.guard.as_ref(),
        )
        .await;

        match written {
            Ok(affected) => {
                debug!(
                    table = target_table,
                    key = %key,
                    write = %approval.write,
                    affected,
                    "Applied"
                );
            }
            Err(e) if e.is_transport() => {
                error!(
                    table = target_table,
                    key = %key,
                    write = %approval.write,
                    error = %e,
                    "Apply failed"
                );
                self.metrics.record_transport_error();
                return Err(e);
            }
            Err(e) => {
                let mapped = MappedRow { values, key };
                return Ok(self.fail(event, direction, Some(&mapped), e.to_string()).await);
            }
        }

        self.metrics.record_applied(system, table, started.elapsed());
        let outcome = SyncOutcomeEvent::success(
            event.clone(),
            direction,
            self.guard.provenance_id(Uuid::new_v4()),
            Utc::now().timestamp_millis(),
        )
        .with_row_key(key.key_string());
        self.publish(outcome).await;

        Ok(Disposition::Applied)
    }

    fn decide(
        &self,
        event: &ChangeEvent,
        direction: Direction,
        mapped: &MappedRow,
        target: Option<&Row>,
        strategy: &Strategy,
    ) -> std::result::Result<Decision, rowsync_engine::Error> {
        let ctx = ResolveContext {
            event,
            direction,
            mapped: &mapped.values,
            target,
        };
        rowsync_engine::decide(&ctx, strategy, &self.resolvers)
    }

    /// Canonical name of the event's source system, or the raw name when it
    /// is not a known alias.
    fn stats_system<'a>(&'a self, event: &'a ChangeEvent) -> &'a str {
        let names = self.registry.names();
        names
            .resolve(&event.source_system)
            .map_or(event.source_system.as_str(), |system| names.canonical(system))
    }

    async fn fail(
        &self,
        event: &ChangeEvent,
        direction: Direction,
        mapped: Option<&MappedRow>,
        message: String,
    ) -> Disposition {
        warn!(
            system = %event.source_system,
            table = %event.source_table,
            operation = ?event.operation,
            error = %message,
            "Event failed"
        );
        self.metrics
            .record_error(self.stats_system(event), &event.source_table);

        let mut outcome = SyncOutcomeEvent::error(
            event.clone(),
            direction,
            message.clone(),
            self.guard.provenance_id(Uuid::new_v4()),
            Utc::now().timestamp_millis(),
        );
        if let Some(mapped) = mapped {
            outcome = outcome.with_row_key(mapped.key.key_string());
        }
        self.publish(outcome).await;

        Disposition::Failed(message)
    }

    async fn publish(&self, outcome: SyncOutcomeEvent) {
        if let Err(e) = self.publisher.publish(&outcome).await {
            warn!(key = %outcome.message_key(), error = %e, "Outcome publish failed");
        }
    }
}

/// Target columns the conflict check needs to see.
fn probe_columns(strategy: &Strategy, mapped: &MappedRow) -> Vec<ColumnName> {
    let mut columns: Vec<ColumnName> = mapped.key.columns().map(str::to_string).collect();
    let mut add = |column: &str| {
        if !columns.iter().any(|c| c == column) {
            columns.push(column.to_string());
        }
    };
    match strategy {
        Strategy::Timestamp { column } | Strategy::Version { column } => add(column),
        Strategy::Custom { .. } => mapped.values.keys().for_each(|c| add(c)),
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_engine::PrimaryKey;
    use serde_json::json;

    #[test]
    fn probe_columns_per_strategy() {
        let mapped = MappedRow {
            values: json!({"id": 1, "name": "a", "version": 2})
                .as_object()
                .cloned()
                .unwrap(),
            key: PrimaryKey::new(vec![("id".into(), json!(1))]),
        };

        let timestamp = Strategy::Timestamp {
            column: "updated_at".into(),
        };
        assert_eq!(probe_columns(&timestamp, &mapped), vec!["id", "updated_at"]);

        let version = Strategy::Version {
            column: "id".into(),
        };
        assert_eq!(probe_columns(&version, &mapped), vec!["id"]);

        let custom = Strategy::Custom {
            resolver: "source_priority".into(),
        };
        assert_eq!(probe_columns(&custom, &mapped), vec!["id", "name", "version"]);
    }
}
