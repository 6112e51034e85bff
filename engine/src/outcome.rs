//! Outcome events published after an event has been processed.

use crate::{ChangeEvent, Direction, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Audit record for one processed change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcomeEvent {
    /// The triggering event, unchanged
    pub event: ChangeEvent,
    pub direction: Direction,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub completion_timestamp: Timestamp,
    /// Fresh provenance id, never the triggering event's
    pub provenance_id: String,
    /// Primary key of the affected row, when it could be determined
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_key: Option<String>,
}

impl SyncOutcomeEvent {
    pub fn success(
        event: ChangeEvent,
        direction: Direction,
        provenance_id: String,
        completion_timestamp: Timestamp,
    ) -> Self {
        Self {
            event,
            direction,
            status: OutcomeStatus::Success,
            error_message: None,
            completion_timestamp,
            provenance_id,
            row_key: None,
        }
    }

    pub fn error(
        event: ChangeEvent,
        direction: Direction,
        message: impl Into<String>,
        provenance_id: String,
        completion_timestamp: Timestamp,
    ) -> Self {
        Self {
            status: OutcomeStatus::Error,
            error_message: Some(message.into()),
            ..Self::success(event, direction, provenance_id, completion_timestamp)
        }
    }

    pub fn with_row_key(mut self, key: impl Into<String>) -> Self {
        self.row_key = Some(key.into());
        self
    }

    /// Partitioning key for the outcome feed: `table-key`, or just the table.
    pub fn message_key(&self) -> String {
        match &self.row_key {
            Some(key) => format!("{}-{}", self.event.source_table, key),
            None => self.event.source_table.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Operation, Row};
    use serde_json::json;

    #[test]
    fn outcome_serialization() {
        let event = ChangeEvent::new(Operation::Create, "mysql", "users", 10).with_after(Row::new());
        let outcome = SyncOutcomeEvent::error(event, Direction::AToB, "boom", "sync-1".into(), 20)
            .with_row_key("7");

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], json!("error"));
        assert_eq!(value["errorMessage"], json!("boom"));
        assert_eq!(value["direction"], json!("a-to-b"));
        assert_eq!(value["event"]["sourceTable"], json!("users"));
        assert_eq!(outcome.message_key(), "users-7");

        let parsed: SyncOutcomeEvent = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, outcome);
    }

    #[test]
    fn success_has_no_error() {
        let event = ChangeEvent::new(Operation::Delete, "postgres", "orders", 10).with_before(Row::new());
        let outcome = SyncOutcomeEvent::success(event, Direction::BToA, "sync-2".into(), 11);

        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert!(outcome.error_message.is_none());
        assert_eq!(outcome.message_key(), "orders");
        assert!(!serde_json::to_string(&outcome).unwrap().contains("errorMessage"));
    }
}
