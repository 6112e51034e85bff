//! System B store on PostgreSQL.
//!
//! Rows travel as a single JSONB parameter and are expanded server side with
//! `jsonb_populate_record`, so every value is cast to its column type by
//! PostgreSQL itself.

use super::sql::{Dialect, GuardValue};
use super::TargetStore;
use crate::error::Result;
use async_trait::async_trait;
use rowsync_engine::{ColumnName, Guard, PrimaryKey, Row, System};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row as _};

const D: Dialect = Dialect::Postgres;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn record(table: &str) -> String {
    format!("jsonb_populate_record(NULL::{}, $1)", D.quote(table))
}

fn key_join(left: &str, right: &str, key_columns: &[&str]) -> String {
    key_columns
        .iter()
        .map(|c| format!("{} = {}", D.column(Some(left), c), D.column(Some(right), c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn fetch_sql(table: &str, key_columns: &[&str]) -> String {
    format!(
        "SELECT row_to_json(t)::jsonb AS doc FROM {} AS t, {} AS k WHERE {} LIMIT 1",
        D.quote(table),
        record(table),
        key_join("t", "k", key_columns)
    )
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    let list = D.quote_all(columns.iter().copied());
    format!(
        "INSERT INTO {} ({list}) SELECT {list} FROM {}",
        D.quote(table),
        record(table)
    )
}

fn update_sql(table: &str, columns: &[&str], key_columns: &[&str], guard: Option<&Guard>) -> String {
    let mut assigned: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !key_columns.contains(c))
        .collect();
    if assigned.is_empty() {
        assigned = key_columns.to_vec();
    }
    let set = assigned
        .iter()
        .map(|c| format!("{} = {}", D.quote(c), D.column(Some("r"), c)))
        .collect::<Vec<_>>()
        .join(", ");

    let mut sql = format!(
        "UPDATE {} AS t SET {set} FROM {} AS r WHERE {}",
        D.quote(table),
        record(table),
        key_join("t", "r", key_columns)
    );
    if let Some(guard) = guard {
        sql.push_str(" AND ");
        sql.push_str(&D.guard_condition(guard, Some("t"), "$2"));
    }
    sql
}

fn delete_sql(table: &str, key_columns: &[&str]) -> String {
    format!(
        "DELETE FROM {} AS t USING {} AS k WHERE {}",
        D.quote(table),
        record(table),
        key_join("t", "k", key_columns)
    )
}

fn upsert_sql(table: &str, columns: &[&str], conflict: &[&str], guard: Option<&Guard>) -> String {
    let list = D.quote_all(columns.iter().copied());
    let mut sql = format!(
        "INSERT INTO {} AS t ({list}) SELECT {list} FROM {} ON CONFLICT ({})",
        D.quote(table),
        record(table),
        D.quote_all(conflict.iter().copied())
    );

    let assigned: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !conflict.contains(c))
        .collect();
    if assigned.is_empty() {
        sql.push_str(" DO NOTHING");
        return sql;
    }

    let set = assigned
        .iter()
        .map(|c| format!("{} = EXCLUDED.{}", D.quote(c), D.quote(c)))
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(" DO UPDATE SET ");
    sql.push_str(&set);
    if let Some(guard) = guard {
        sql.push_str(" WHERE ");
        sql.push_str(&D.guard_condition(guard, Some("t"), "$2"));
    }
    sql
}

fn scan_sql(table: &str, order_by: &[&str]) -> String {
    let order = order_by
        .iter()
        .map(|c| D.column(Some("t"), c))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT row_to_json(t)::jsonb AS doc FROM {} AS t ORDER BY {order} LIMIT $1 OFFSET $2",
        D.quote(table)
    )
}

fn key_row(key: &PrimaryKey) -> Row {
    key.iter()
        .map(|(c, v)| (c.to_string(), v.clone()))
        .collect()
}

fn bind_guard(query: PgQuery<'_>, value: Option<GuardValue>) -> PgQuery<'_> {
    match value {
        Some(GuardValue::At(at)) => query.bind(at),
        Some(GuardValue::Version(version)) => query.bind(version),
        None => query,
    }
}

#[async_trait]
impl TargetStore for PgStore {
    fn system(&self) -> System {
        System::B
    }

    async fn fetch(
        &self,
        table: &str,
        key: &PrimaryKey,
        _columns: &[ColumnName],
    ) -> Result<Option<Row>> {
        let key_columns: Vec<&str> = key.columns().collect();
        let sql = fetch_sql(table, &key_columns);
        let found = sqlx::query(&sql)
            .bind(Json(key_row(key)))
            .fetch_optional(&self.pool)
            .await?;

        match found {
            Some(row) => Ok(Some(row.try_get::<Json<Row>, _>("doc")?.0)),
            None => Ok(None),
        }
    }

    async fn insert(&self, table: &str, row: &Row, _key: &PrimaryKey) -> Result<u64> {
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let sql = insert_sql(table, &columns);
        let result = sqlx::query(&sql).bind(Json(row)).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn update(
        &self,
        table: &str,
        row: &Row,
        key: &PrimaryKey,
        guard: Option<&Guard>,
    ) -> Result<u64> {
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let key_columns: Vec<&str> = key.columns().collect();
        let sql = update_sql(table, &columns, &key_columns, guard);
        let guard_value = guard.map(GuardValue::of).transpose()?;

        // Key values come from the key, not the row, so the predicate matches
        // even when the row omits them.
        let mut record = row.clone();
        for (column, value) in key.iter() {
            record.insert(column.to_string(), value.clone());
        }

        let query = bind_guard(sqlx::query(&sql).bind(Json(record)), guard_value);
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn delete(&self, table: &str, key: &PrimaryKey) -> Result<u64> {
        let key_columns: Vec<&str> = key.columns().collect();
        let sql = delete_sql(table, &key_columns);
        let result = sqlx::query(&sql)
            .bind(Json(key_row(key)))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert(
        &self,
        table: &str,
        row: &Row,
        conflict_columns: &[ColumnName],
        guard: Option<&Guard>,
    ) -> Result<u64> {
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let conflict: Vec<&str> = conflict_columns.iter().map(String::as_str).collect();
        let sql = upsert_sql(table, &columns, &conflict, guard);
        let guard_value = guard.map(GuardValue::of).transpose()?;

        let query = bind_guard(sqlx::query(&sql).bind(Json(row)), guard_value);
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn scan(
        &self,
        table: &str,
        _columns: &[ColumnName],
        order_by: &[ColumnName],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>> {
        let order: Vec<&str> = order_by.iter().map(String::as_str).collect();
        let sql = scan_sql(table, &order);
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Row> { Ok(row.try_get::<Json<Row>, _>("doc")?.0) })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
