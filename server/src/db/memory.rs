//! In-process store for tests and dry runs.

use super::TargetStore;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use dashmap::DashMap;
use rowsync_engine::{ColumnName, Guard, PrimaryKey, Row, System};
use serde_json::Value;
use sqlx::error::{DatabaseError, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Tables held as vectors of rows; keys are matched by value.
///
/// Guards are evaluated with [`Guard::admits`] under the table's lock, which
/// gives the same compare-and-set semantics as the SQL stores.
pub struct MemoryStore {
    system: System,
    tables: DashMap<String, Vec<Row>>,
    down: AtomicBool,
    failing_writes: AtomicUsize,
    failing_probes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new(system: System) -> Self {
        Self {
            system,
            tables: DashMap::new(),
            down: AtomicBool::new(false),
            failing_writes: AtomicUsize::new(0),
            failing_probes: AtomicBool::new(false),
            writes: AtomicU64::new(0),
        }
    }

    /// Seed a row directly, bypassing the write counters.
    pub fn put(&self, table: &str, row: Row) {
        self.tables.entry(table.to_string()).or_default().push(row);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .get(table)
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn get(&self, table: &str, key: &PrimaryKey) -> Option<Row> {
        self.tables
            .get(table)
            .and_then(|rows| rows.iter().find(|row| key.matches(row)).cloned())
    }

    /// Number of executed write statements, including no-ops.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Make every call fail as if the database were unreachable.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a transport error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail conflict probes while writes keep working.
    pub fn fail_probes(&self, failing: bool) {
        self.failing_probes.store(failing, Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(unreachable_error());
        }
        Ok(())
    }

    fn begin_write(&self) -> Result<()> {
        self.check_up()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(unreachable_error());
        }
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn unreachable_error() -> SyncError {
    SyncError::Database(sqlx::Error::PoolTimedOut)
}

/// Unique violation, reported the way a SQL store reports one.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
struct DuplicateKey {
    message: String,
}

impl DatabaseError for DuplicateKey {
    fn message(&self) -> &str {
        &self.message
    }

    fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
        self
    }

    fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
        self
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::UniqueViolation
    }
}

impl From<DuplicateKey> for SyncError {
    fn from(e: DuplicateKey) -> Self {
        SyncError::Database(sqlx::Error::Database(Box::new(e)))
    }
}

fn admitted(guard: Option<&Guard>, row: &Row) -> bool {
    guard.map_or(true, |g| g.admits(row))
}

fn compare(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
    match (a.and_then(Value::as_f64), b.and_then(Value::as_f64)) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        _ => {
            let text = |v: Option<&Value>| v.map(|v| v.to_string()).unwrap_or_default();
            text(a).cmp(&text(b))
        }
    }
}

fn merge(existing: &mut Row, row: &Row) {
    for (column, value) in row {
        existing.insert(column.clone(), value.clone());
    }
}

#[async_trait]
impl TargetStore for MemoryStore {
    fn system(&self) -> System {
        self.system
    }

    async fn fetch(
        &self,
        table: &str,
        key: &PrimaryKey,
        _columns: &[ColumnName],
    ) -> Result<Option<Row>> {
        self.check_up()?;
        if self.failing_probes.load(Ordering::SeqCst) {
            return Err(unreachable_error());
        }
        Ok(self.get(table, key))
    }

    async fn insert(&self, table: &str, row: &Row, key: &PrimaryKey) -> Result<u64> {
        self.begin_write()?;
        let mut rows = self.tables.entry(table.to_string()).or_default();
        if rows.iter().any(|existing| key.matches(existing)) {
            return Err(DuplicateKey {
                message: format!("duplicate key {key} in {table}"),
            }
            .into());
        }
        rows.push(row.clone());
        Ok(1)
    }

    async fn update(
        &self,
        table: &str,
        row: &Row,
        key: &PrimaryKey,
        guard: Option<&Guard>,
    ) -> Result<u64> {
        self.begin_write()?;
        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let mut affected = 0;
        for existing in rows.iter_mut().filter(|r| key.matches(r)) {
            if admitted(guard, existing) {
                merge(existing, row);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn delete(&self, table: &str, key: &PrimaryKey) -> Result<u64> {
        self.begin_write()?;
        let Some(mut rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| !key.matches(r));
        Ok((before - rows.len()) as u64)
    }

    async fn upsert(
        &self,
        table: &str,
        row: &Row,
        conflict_columns: &[ColumnName],
        guard: Option<&Guard>,
    ) -> Result<u64> {
        self.begin_write()?;
        let mut rows = self.tables.entry(table.to_string()).or_default();
        let collides = |existing: &Row| {
            conflict_columns
                .iter()
                .all(|c| existing.get(c).is_some() && existing.get(c) == row.get(c))
        };

        match rows.iter_mut().find(|existing| collides(existing)) {
            Some(existing) if admitted(guard, existing) => {
                merge(existing, row);
                Ok(1)
            }
            Some(_) => Ok(0),
            None => {
                rows.push(row.clone());
                Ok(1)
            }
        }
    }

    async fn scan(
        &self,
        table: &str,
        _columns: &[ColumnName],
        order_by: &[ColumnName],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>> {
        self.check_up()?;
        let mut rows = self.rows(table);
        rows.sort_by(|a, b| {
            order_by
                .iter()
                .map(|c| compare(a.get(c), b.get(c)))
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn ping(&self) -> Result<()> {
        self.check_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn key(id: i64) -> PrimaryKey {
        PrimaryKey::new(vec![("id".into(), json!(id))])
    }

    #[tokio::test]
    async fn guarded_update_respects_newer_rows() {
        let store = MemoryStore::new(System::B);
        store.put("users", row(json!({"id": 1, "name": "new", "updated_at": 200})));

        let stale = Guard::TimestampBefore {
            column: "updated_at".into(),
            millis: 100,
        };
        let affected = store
            .update("users", &row(json!({"id": 1, "name": "old"})), &key(1), Some(&stale))
            .await
            .unwrap();
        assert_eq!(affected, 0);
        assert_eq!(store.get("users", &key(1)).unwrap()["name"], json!("new"));
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates() {
        let store = MemoryStore::new(System::A);
        let conflict = vec!["id".to_string()];

        store
            .upsert("users", &row(json!({"id": 1, "name": "a"})), &conflict, None)
            .await
            .unwrap();
        store
            .upsert("users", &row(json!({"id": 1, "name": "b"})), &conflict, None)
            .await
            .unwrap();

        assert_eq!(store.rows("users"), vec![row(json!({"id": 1, "name": "b"}))]);
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn injected_failures_are_transport_errors() {
        let store = MemoryStore::new(System::B);
        store.fail_next_writes(1);

        let err = store
            .insert("users", &row(json!({"id": 1})), &key(1))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(
            store.insert("users", &row(json!({"id": 1})), &key(1)).await.unwrap(),
            1
        );

        store.set_down(true);
        assert!(store.ping().await.is_err());
        assert!(store.fetch("users", &key(1), &[]).await.unwrap_err().is_transport());
    }

    #[tokio::test]
    async fn insert_rejects_existing_key() {
        let store = MemoryStore::new(System::B);
        store.put("users", row(json!({"id": 1, "name": "a"})));

        let err = store
            .insert("users", &row(json!({"id": 1, "name": "b"})), &key(1))
            .await
            .unwrap_err();
        match &err {
            SyncError::Database(sqlx::Error::Database(db)) => {
                assert_eq!(db.kind(), ErrorKind::UniqueViolation);
            }
            other => panic!("expected a database error, got {other:?}"),
        }
        assert!(!err.is_transport());
        assert_eq!(store.rows("users"), vec![row(json!({"id": 1, "name": "a"}))]);

        store
            .insert("users", &row(json!({"id": 2, "name": "b"})), &key(2))
            .await
            .unwrap();
        assert_eq!(store.rows("users").len(), 2);
    }

    #[tokio::test]
    async fn scan_pages_in_key_order() {
        let store = MemoryStore::new(System::A);
        for id in [3, 10, 1, 2] {
            store.put("t", row(json!({"id": id})));
        }
        let order = vec!["id".to_string()];
        let page = store.scan("t", &[], &order, 2, 1).await.unwrap();
        assert_eq!(page, vec![row(json!({"id": 2})), row(json!({"id": 3}))]);
    }
}
