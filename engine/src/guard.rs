//! Sync loop prevention.
//!
//! Every write this engine makes is captured again by the change feed of the
//! database it wrote to. The [`LoopGuard`] recognises those echoes so they are
//! dropped instead of being synced back.

use crate::{ChangeEvent, ColumnName};
use serde_json::Value;

/// Recognises events produced by this engine instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopGuard {
    prefix: String,
    marker_column: Option<ColumnName>,
}

impl LoopGuard {
    pub fn new(instance_tag: impl AsRef<str>) -> Self {
        Self {
            prefix: format!("{}-", instance_tag.as_ref()),
            marker_column: None,
        }
    }

    /// Also stamp applied rows with a provenance id in `column`, and treat
    /// captured rows whose stamp changed to one of ours as echoes.
    pub fn with_marker_column(mut self, column: impl Into<ColumnName>) -> Self {
        self.marker_column = Some(column.into());
        self
    }

    pub fn marker_column(&self) -> Option<&str> {
        self.marker_column.as_deref()
    }

    /// A fresh provenance id for an outbound write or outcome event.
    ///
    /// The caller supplies the nonce so the guard stays deterministic.
    pub fn provenance_id(&self, nonce: uuid::Uuid) -> String {
        format!("{}{}", self.prefix, nonce)
    }

    /// Whether a provenance id was minted by this instance.
    pub fn is_own_id(&self, id: &str) -> bool {
        id.starts_with(&self.prefix)
    }

    /// Whether `event` is an echo of this engine's own write.
    pub fn is_own(&self, event: &ChangeEvent) -> bool {
        if event
            .provenance_id
            .as_deref()
            .is_some_and(|id| self.is_own_id(id))
        {
            return true;
        }

        let Some(column) = &self.marker_column else {
            return false;
        };
        let Some(stamp) = event.after.as_ref().and_then(|row| row.get(column)) else {
            return false;
        };
        let ours = matches!(stamp, Value::String(id) if self.is_own_id(id));
        // A later edit by someone else leaves our old stamp in place
        let changed = event.before.as_ref().and_then(|row| row.get(column)) != Some(stamp);

        ours && changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Operation, Row};
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn provenance_prefix_match() {
        let guard = LoopGuard::new("db-sync-service");
        let id = guard.provenance_id(uuid::Uuid::nil());
        assert_eq!(id, "db-sync-service-00000000-0000-0000-0000-000000000000");

        let event = ChangeEvent::new(Operation::Create, "mysql", "users", 1)
            .with_after(Row::new())
            .with_provenance(id, 2);
        assert!(guard.is_own(&event));

        let foreign = ChangeEvent::new(Operation::Create, "mysql", "users", 1)
            .with_after(Row::new())
            .with_provenance("other-service-1", 2);
        assert!(!guard.is_own(&foreign));

        // a longer tag sharing our prefix is not ours
        let lookalike = ChangeEvent::new(Operation::Create, "mysql", "users", 1)
            .with_after(Row::new())
            .with_provenance("db-sync-service2-abc", 2);
        assert!(!guard.is_own(&lookalike));

        let untagged = ChangeEvent::new(Operation::Create, "mysql", "users", 1).with_after(Row::new());
        assert!(!guard.is_own(&untagged));
    }

    #[test]
    fn marker_column_echoes() {
        let guard = LoopGuard::new("sync").with_marker_column("sync_origin");

        let echo = ChangeEvent::new(Operation::Create, "postgres", "users", 1)
            .with_after(row(json!({"id": 1, "sync_origin": "sync-abc"})));
        assert!(guard.is_own(&echo));

        let update_echo = ChangeEvent::new(Operation::Update, "postgres", "users", 1)
            .with_before(row(json!({"id": 1, "sync_origin": "sync-abc"})))
            .with_after(row(json!({"id": 1, "sync_origin": "sync-def"})));
        assert!(guard.is_own(&update_echo));

        let user_edit = ChangeEvent::new(Operation::Update, "postgres", "users", 1)
            .with_before(row(json!({"id": 1, "name": "a", "sync_origin": "sync-abc"})))
            .with_after(row(json!({"id": 1, "name": "b", "sync_origin": "sync-abc"})));
        assert!(!guard.is_own(&user_edit));

        let plain = ChangeEvent::new(Operation::Create, "postgres", "users", 1)
            .with_after(row(json!({"id": 1, "sync_origin": null})));
        assert!(!guard.is_own(&plain));

        assert!(!LoopGuard::new("sync").is_own(&echo));
    }
}
