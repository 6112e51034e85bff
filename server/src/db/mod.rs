//! Target database access.
//!
//! Every write the engine approves lands in one of two [`TargetStore`]s. The
//! SQL stores push the compare-and-set [`Guard`] into the statement itself so
//! the check and the write are a single atomic operation.

mod memory;
mod mysql;
mod pool;
mod postgres;
mod sql;

pub use memory::MemoryStore;
pub use mysql::MySqlStore;
pub use pool::{create_mysql_pool, create_pg_pool};
pub use postgres::PgStore;

use crate::error::Result;
use async_trait::async_trait;
use rowsync_engine::{ColumnName, Guard, PrimaryKey, Row, System, WriteKind};
use std::sync::Arc;

/// A relational store the sync service reads conflict state from and writes to.
///
/// Rows are JSON objects in the store's own representation. Writes report the
/// number of affected rows; zero is not an error.
#[async_trait]
pub trait TargetStore: Send + Sync {
    fn system(&self) -> System;

    /// Current row for `key`, with at least `columns` present.
    async fn fetch(
        &self,
        table: &str,
        key: &PrimaryKey,
        columns: &[ColumnName],
    ) -> Result<Option<Row>>;

    /// Insert `row`, whose primary key is `key`. A key that already exists
    /// is rejected with the store's unique-violation error.
    async fn insert(&self, table: &str, row: &Row, key: &PrimaryKey) -> Result<u64>;

    /// Update the row matching `key`, only where `guard` admits it.
    async fn update(
        &self,
        table: &str,
        row: &Row,
        key: &PrimaryKey,
        guard: Option<&Guard>,
    ) -> Result<u64>;

    async fn delete(&self, table: &str, key: &PrimaryKey) -> Result<u64>;

    /// Insert, or update on a `conflict_columns` collision where `guard` admits it.
    async fn upsert(
        &self,
        table: &str,
        row: &Row,
        conflict_columns: &[ColumnName],
        guard: Option<&Guard>,
    ) -> Result<u64>;

    /// One page of `table`, ordered by `order_by`.
    async fn scan(
        &self,
        table: &str,
        columns: &[ColumnName],
        order_by: &[ColumnName],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>>;

    /// Connectivity check for the health monitor.
    async fn ping(&self) -> Result<()>;
}

/// Execute an approved write.
pub async fn apply(
    store: &dyn TargetStore,
    table: &str,
    write: WriteKind,
    row: &Row,
    key: &PrimaryKey,
    guard: Option<&Guard>,
) -> Result<u64> {
    match write {
        WriteKind::Insert => store.insert(table, row, key).await,
        WriteKind::Update => store.update(table, row, key, guard).await,
        WriteKind::Delete => store.delete(table, key).await,
        WriteKind::Upsert => {
            let conflict: Vec<ColumnName> = key.columns().map(str::to_string).collect();
            store.upsert(table, row, &conflict, guard).await
        }
    }
}

/// The two stores, addressed by system.
#[derive(Clone)]
pub struct Stores {
    pub a: Arc<dyn TargetStore>,
    pub b: Arc<dyn TargetStore>,
}

impl Stores {
    pub fn new(a: Arc<dyn TargetStore>, b: Arc<dyn TargetStore>) -> Self {
        Self { a, b }
    }

    pub fn get(&self, system: System) -> &Arc<dyn TargetStore> {
        match system {
            System::A => &self.a,
            System::B => &self.b,
        }
    }
}
