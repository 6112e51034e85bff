//! Shared fixtures: the built-in mappings over two in-memory stores.

#![allow(dead_code)]

use rowsync_engine::{
    ChangeEvent, LoopGuard, MappingDocument, MappingRegistry, Operation, ResolverRegistry, Row,
    System, SystemNames,
};
use rowsync_server::db::{MemoryStore, Stores};
use rowsync_server::health::SyncMetrics;
use rowsync_server::publish::RecordingPublisher;
use rowsync_server::sync::Dispatcher;
use serde_json::Value;
use std::sync::Arc;

/// 2024-01-01T10:00:00Z
pub const JAN: i64 = 1_704_103_200_000;
/// 2024-06-01T00:00:00Z
pub const JUNE: i64 = 1_717_200_000_000;

pub struct Harness {
    pub a: Arc<MemoryStore>,
    pub b: Arc<MemoryStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub metrics: Arc<SyncMetrics>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_guard(LoopGuard::new("db-sync-service"))
    }

    pub fn with_guard(guard: LoopGuard) -> Self {
        let mut registry =
            MappingRegistry::from_document(MappingDocument::builtin(), SystemNames::default())
                .unwrap();
        registry.derive_reverse_mappings().unwrap();

        let a = Arc::new(MemoryStore::new(System::A));
        let b = Arc::new(MemoryStore::new(System::B));
        let publisher = Arc::new(RecordingPublisher::new());
        let metrics = Arc::new(SyncMetrics::new());
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            Arc::new(ResolverRegistry::new()),
            Stores::new(a.clone(), b.clone()),
            publisher.clone(),
            metrics.clone(),
        )
        .with_loop_guard(guard);

        Self {
            a,
            b,
            publisher,
            metrics,
            dispatcher,
        }
    }
}

pub fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

/// A System A `users` change at `ts`.
pub fn mysql_user(operation: Operation, ts: i64, after: Value) -> ChangeEvent {
    let event = ChangeEvent::new(operation, "mysql", "users", ts);
    match operation {
        Operation::Delete => event.with_before(row(after)),
        _ => event.with_after(row(after)),
    }
}

/// A capture envelope as it arrives on the feed.
pub fn envelope(op: &str, table: &str, ts: i64, after: Value) -> Value {
    serde_json::json!({
        "before": null,
        "after": after,
        "source": {"name": "mysql", "db": "legacy_db", "table": table, "ts_ms": ts},
        "op": op,
        "ts_ms": ts
    })
}
