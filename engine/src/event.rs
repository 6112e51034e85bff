//! Change events captured from the two databases.
//!
//! A [`ChangeEvent`] describes one row-level mutation. Events are never
//! mutated in place by the pipeline; the conflict resolver works on its own
//! copy of the operation when it reclassifies a create.

use crate::{error::Result, Error, Row, TableName, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the two independently writable databases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum System {
    /// The legacy store (MySQL in the reference deployment)
    #[serde(alias = "mysql", alias = "legacy_db")]
    A,
    /// The new store (PostgreSQL in the reference deployment)
    #[serde(alias = "postgres", alias = "postgresql", alias = "new_db")]
    B,
}

impl System {
    /// The other system.
    pub fn opposite(self) -> Self {
        match self {
            System::A => System::B,
            System::B => System::A,
        }
    }
}

impl fmt::Display for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            System::A => write!(f, "system-a"),
            System::B => write!(f, "system-b"),
        }
    }
}

/// Direction in which an event flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    AToB,
    BToA,
}

impl Direction {
    /// Direction of an event captured on `source`.
    pub fn from_source(source: System) -> Self {
        match source {
            System::A => Direction::AToB,
            System::B => Direction::BToA,
        }
    }

    pub fn source(self) -> System {
        match self {
            Direction::AToB => System::A,
            Direction::BToA => System::B,
        }
    }

    pub fn target(self) -> System {
        self.source().opposite()
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::AToB => write!(f, "a-to-b"),
            Direction::BToA => write!(f, "b-to-a"),
        }
    }
}

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    /// Initial bulk-load row
    #[serde(rename = "r")]
    SnapshotRead,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
            Operation::SnapshotRead => write!(f, "snapshot-read"),
        }
    }
}

/// Transaction ordering hints attached by the capture tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub id: String,
    /// Position of the event within the whole transaction
    #[serde(default, alias = "total_order")]
    pub total_order: u64,
    /// Position of the event among events of the same table
    #[serde(default, alias = "data_collection_order")]
    pub data_collection_order: u64,
}

/// One captured row mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Row state before the change (required for deletes)
    pub before: Option<Row>,
    /// Row state after the change (absent on deletes)
    pub after: Option<Row>,
    pub operation: Operation,
    /// System identifier as reported by the feed (topic prefix or connector name)
    pub source_system: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_database: Option<String>,
    pub source_table: TableName,
    /// Capture time in milliseconds since epoch
    pub event_timestamp_millis: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionInfo>,
    /// Set only on events emitted by a sync engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance_timestamp: Option<Timestamp>,
}

impl ChangeEvent {
    /// Create a bare event. Attach payloads with [`with_after`](Self::with_after)
    /// and [`with_before`](Self::with_before).
    pub fn new(
        operation: Operation,
        source_system: impl Into<String>,
        source_table: impl Into<TableName>,
        event_timestamp_millis: Timestamp,
    ) -> Self {
        Self {
            before: None,
            after: None,
            operation,
            source_system: source_system.into(),
            source_database: None,
            source_table: source_table.into(),
            event_timestamp_millis,
            transaction: None,
            provenance_id: None,
            provenance_timestamp: None,
        }
    }

    /// A snapshot-read event for one row of an initial bulk load.
    pub fn snapshot(
        source_system: impl Into<String>,
        source_table: impl Into<TableName>,
        row: Row,
        timestamp: Timestamp,
    ) -> Self {
        Self::new(Operation::SnapshotRead, source_system, source_table, timestamp).with_after(row)
    }

    pub fn with_after(mut self, row: Row) -> Self {
        self.after = Some(row);
        self
    }

    pub fn with_before(mut self, row: Row) -> Self {
        self.before = Some(row);
        self
    }

    pub fn with_provenance(mut self, id: impl Into<String>, timestamp: Timestamp) -> Self {
        self.provenance_id = Some(id.into());
        self.provenance_timestamp = Some(timestamp);
        self
    }

    /// The row snapshot that drives mapping for this operation.
    ///
    /// `after` for create, update and snapshot-read; `before` for delete.
    pub fn payload(&self) -> Result<&Row> {
        let (row, role) = match self.operation {
            Operation::Delete => (self.before.as_ref(), "before"),
            _ => (self.after.as_ref(), "after"),
        };
        row.ok_or_else(|| {
            Error::InvalidEvent(format!(
                "{} event on '{}' has no '{}' row",
                self.operation, self.source_table, role
            ))
        })
    }

    /// Decode a capture-tool envelope.
    ///
    /// Accepts both the bare envelope and the `{schema, payload}` wrapper.
    /// Returns `Ok(None)` for tombstones (a JSON `null` value), which carry
    /// nothing to apply. `system_hint` is the system name derived from the
    /// transport (for instance the topic prefix); when absent, the envelope's
    /// `source.name` is used.
    pub fn decode(bytes: &[u8], system_hint: Option<&str>) -> Result<Option<Self>> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let value: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidEvent(format!("malformed envelope: {e}")))?;
        Self::from_value(value, system_hint)
    }

    /// Decode an already parsed envelope. See [`decode`](Self::decode).
    pub fn from_value(value: serde_json::Value, system_hint: Option<&str>) -> Result<Option<Self>> {
        let value = match value {
            serde_json::Value::Null => return Ok(None),
            serde_json::Value::Object(mut obj)
                if obj.contains_key("payload") && !obj.contains_key("op") =>
            {
                match obj.remove("payload") {
                    Some(serde_json::Value::Null) | None => return Ok(None),
                    Some(inner) => inner,
                }
            }
            other => other,
        };

        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::InvalidEvent(format!("malformed envelope: {e}")))?;

        let source = envelope.source.unwrap_or_default();
        let source_system = system_hint
            .map(str::to_string)
            .or(source.name)
            .ok_or_else(|| Error::InvalidEvent("cannot determine source system".into()))?;
        let source_table = source
            .table
            .ok_or_else(|| Error::InvalidEvent("envelope has no source table".into()))?;
        let event_timestamp_millis = envelope
            .ts_ms
            .or(source.ts_ms)
            .ok_or_else(|| Error::InvalidEvent("envelope has no capture timestamp".into()))?;

        let event = ChangeEvent {
            before: envelope.before,
            after: envelope.after,
            operation: envelope.op,
            source_system,
            source_database: source.db,
            source_table,
            event_timestamp_millis,
            transaction: envelope.transaction,
            provenance_id: envelope.sync_id,
            provenance_timestamp: envelope.sync_timestamp,
        };

        event.payload()?;
        Ok(Some(event))
    }
}

/// Wire shape of a capture-tool envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    before: Option<Row>,
    #[serde(default)]
    after: Option<Row>,
    #[serde(default)]
    source: Option<SourceInfo>,
    op: Operation,
    #[serde(default)]
    ts_ms: Option<Timestamp>,
    #[serde(default)]
    transaction: Option<TransactionInfo>,
    #[serde(default)]
    sync_id: Option<String>,
    #[serde(default)]
    sync_timestamp: Option<Timestamp>,
}

#[derive(Debug, Default, Deserialize)]
struct SourceInfo {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    db: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    ts_ms: Option<Timestamp>,
}
