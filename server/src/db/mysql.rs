//! System A store on MySQL.

use super::sql::{Dialect, GuardValue};
use super::TargetStore;
use crate::error::Result;
use async_trait::async_trait;
use rowsync_engine::{ColumnName, Guard, PrimaryKey, Row, System};
use serde_json::Value;
use sqlx::mysql::MySqlArguments;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{MySql, MySqlPool, Row as _};

const D: Dialect = Dialect::MySql;

type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;

pub struct MySqlStore {
    pool: MySqlPool,
}

impl MySqlStore {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn key_predicate(key_columns: &[&str]) -> String {
    key_columns
        .iter()
        .map(|c| format!("{} = ?", D.quote(c)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// `JSON_OBJECT('a', `a`, ...)` over the given columns.
fn json_object(columns: &[&str]) -> String {
    let pairs = columns
        .iter()
        .map(|c| format!("'{}', {}", c.replace('\'', "''"), D.quote(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("JSON_OBJECT({pairs})")
}

fn fetch_sql(table: &str, columns: &[&str], key_columns: &[&str]) -> String {
    format!(
        "SELECT {} AS doc FROM {} WHERE {} LIMIT 1",
        json_object(columns),
        D.quote(table),
        key_predicate(key_columns)
    )
}

fn insert_sql(table: &str, columns: &[&str]) -> String {
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        D.quote(table),
        D.quote_all(columns.iter().copied()),
        placeholders(columns.len())
    )
}

fn update_sql(table: &str, columns: &[&str], key_columns: &[&str], guard: Option<&Guard>) -> String {
    let set = columns
        .iter()
        .map(|c| format!("{} = ?", D.quote(c)))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "UPDATE {} SET {set} WHERE {}",
        D.quote(table),
        key_predicate(key_columns)
    );
    if let Some(guard) = guard {
        sql.push_str(" AND ");
        sql.push_str(&D.guard_condition(guard, None, "?"));
    }
    sql
}

fn delete_sql(table: &str, key_columns: &[&str]) -> String {
    format!("DELETE FROM {} WHERE {}", D.quote(table), key_predicate(key_columns))
}

/// Columns assigned on a duplicate key, with the guard column last.
///
/// MySQL evaluates the assignments left to right against the partially
/// updated row, so the guard must see the old value in every `IF`.
fn upsert_assignments<'a>(columns: &[&'a str], conflict: &[&str], guard: Option<&Guard>) -> Vec<&'a str> {
    let mut assigned: Vec<&str> = columns
        .iter()
        .copied()
        .filter(|c| !conflict.contains(c))
        .collect();
    if let Some(guard) = guard {
        if let Some(pos) = assigned.iter().position(|c| *c == guard.column()) {
            let column = assigned.remove(pos);
            assigned.push(column);
        }
    }
    assigned
}

fn upsert_sql(table: &str, columns: &[&str], conflict: &[&str], guard: Option<&Guard>) -> String {
    let mut sql = insert_sql(table, columns);
    sql.push_str(" ON DUPLICATE KEY UPDATE ");

    let assigned = upsert_assignments(columns, conflict, guard);
    if assigned.is_empty() {
        let column = conflict.first().or(columns.first()).copied().unwrap_or("id");
        let quoted = D.quote(column);
        sql.push_str(&format!("{quoted} = {quoted}"));
        return sql;
    }

    let set = assigned
        .iter()
        .map(|c| {
            let quoted = D.quote(c);
            match guard {
                Some(guard) => format!(
                    "{quoted} = IF({}, VALUES({quoted}), {quoted})",
                    D.guard_condition(guard, None, "?")
                ),
                None => format!("{quoted} = VALUES({quoted})"),
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    sql.push_str(&set);
    sql
}

fn scan_sql(table: &str, columns: &[&str], order_by: &[&str]) -> String {
    format!(
        "SELECT {} AS doc FROM {} ORDER BY {} LIMIT ? OFFSET ?",
        json_object(columns),
        D.quote(table),
        D.quote_all(order_by.iter().copied())
    )
}

fn bind_value<'q>(query: MySqlQuery<'q>, value: &'q Value) -> MySqlQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                query.bind(i)
            } else if let Some(u) = n.as_u64() {
                query.bind(u)
            } else {
                query.bind(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn bind_guard(query: MySqlQuery<'_>, value: GuardValue) -> MySqlQuery<'_> {
    match value {
        GuardValue::At(at) => query.bind(at.naive_utc()),
        GuardValue::Version(version) => query.bind(version),
    }
}

/// Requested columns plus key columns, without duplicates.
fn probe_columns<'a>(columns: &'a [ColumnName], key: &'a PrimaryKey) -> Vec<&'a str> {
    let mut all: Vec<&str> = key.columns().collect();
    for column in columns {
        if !all.contains(&column.as_str()) {
            all.push(column);
        }
    }
    all
}

#[async_trait]
impl TargetStore for MySqlStore {
    fn system(&self) -> System {
        System::A
    }

    async fn fetch(
        &self,
        table: &str,
        key: &PrimaryKey,
        columns: &[ColumnName],
    ) -> Result<Option<Row>> {
        let key_columns: Vec<&str> = key.columns().collect();
        let sql = fetch_sql(table, &probe_columns(columns, key), &key_columns);

        let mut query = sqlx::query(&sql);
        for (_, value) in key.iter() {
            query = bind_value(query, value);
        }

        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(row.try_get::<Json<Row>, _>("doc")?.0)),
            None => Ok(None),
        }
    }

    async fn insert(&self, table: &str, row: &Row, _key: &PrimaryKey) -> Result<u64> {
        let columns: Vec<&str> = row.keys().map(String::as_str).collect();
        let sql = insert_sql(table, &columns);

        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn update(
        &self,
        table: &str,
        row: &Row,
        key: &PrimaryKey,
        guard: Option<&Guard>,
    ) -> Result<u64> {
        let key_columns: Vec<&str> = key.columns().collect();
        let assigned: Vec<(&str, &Value)> = row
            .iter()
            .filter(|(c, _)| !key_columns.contains(&c.as_str()))
            .map(|(c, v)| (c.as_str(), v))
            .collect();
        if assigned.is_empty() {
            return Ok(0);
        }

        let columns: Vec<&str> = assigned.iter().map(|(c, _)| *c).collect();
        let sql = update_sql(table, &columns, &key_columns, guard);
        let guard_value = guard.map(GuardValue::of).transpose()?;

        let mut query = sqlx::query(&sql);
        for (_, value) in &assigned {
            query = bind_value(query, value);
        }
        for (_, value) in key.iter() {
            query = bind_value(query, value);
        }
        if let Some(value) = guard_value {
            query = bind_guard(query, value);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn delete(&self, table: &str, key: &PrimaryKey) -> Result<u64> {
        let key_columns: Vec<&str> = key.columns().collect();
        let sql = delete_sql(table, &key_columns);

        let mut query = sqlx::query(&sql);
        for (_, value) in key.iter() {
            query = bind_value(query, value);
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
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

        let mut query = sqlx::query(&sql);
        for value in row.values() {
            query = bind_value(query, value);
        }
        // One guard parameter per guarded assignment
        if let Some(value) = guard_value {
            for _ in upsert_assignments(&columns, &conflict, guard) {
                query = bind_guard(query, value);
            }
        }
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    async fn scan(
        &self,
        table: &str,
        columns: &[ColumnName],
        order_by: &[ColumnName],
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Row>> {
        let columns: Vec<&str> = columns.iter().map(String::as_str).collect();
        let order: Vec<&str> = order_by.iter().map(String::as_str).collect();
        let sql = scan_sql(table, &columns, &order);

        let rows = sqlx::query(&sql)
            .bind(limit as u64)
            .bind(offset as u64)
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
