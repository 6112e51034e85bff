//! Conflict resolution rules.
//!
//! The rules here are pure: the caller fetches the current target row (if the
//! operation needs it) and [`decide`] turns that state into a [`Decision`].
//! Approved updates carry a [`Guard`] that the apply layer re-checks
//! atomically in the write's WHERE clause, so a row that changed between the
//! read and the write is not overwritten by a stale event.
//!
//! | operation     | rule                                                      |
//! |---------------|-----------------------------------------------------------|
//! | delete        | always approved                                           |
//! | snapshot-read | always approved, written as an unguarded upsert           |
//! | create        | insert if the key is absent, otherwise the update rules   |
//! | update        | the mapping's strategy (timestamp, version or custom)     |

use crate::{
    error::Result,
    event::{ChangeEvent, Operation},
    types::parse_timestamp,
    ColumnName, Direction, Error, Row, System, Timestamp,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Name the built-in [`SourcePriority`] resolver is registered under.
pub const SOURCE_PRIORITY: &str = "source_priority";

/// A resolved conflict strategy for one mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum Strategy {
    Timestamp { column: ColumnName },
    Version { column: ColumnName },
    Custom { resolver: String },
}

/// The kind of write the apply layer should perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteKind {
    Insert,
    Update,
    Upsert,
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteKind::Insert => write!(f, "insert"),
            WriteKind::Update => write!(f, "update"),
            WriteKind::Upsert => write!(f, "upsert"),
            WriteKind::Delete => write!(f, "delete"),
        }
    }
}

/// Compare-and-set condition re-checked against the target row at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Guard {
    /// `column IS NULL OR column < millis`
    TimestampBefore { column: ColumnName, millis: Timestamp },
    /// `COALESCE(column, 0) < version`
    VersionBelow { column: ColumnName, version: i64 },
}

impl Guard {
    pub fn column(&self) -> &str {
        match self {
            Guard::TimestampBefore { column, .. } | Guard::VersionBelow { column, .. } => column,
        }
    }

    /// Evaluate the guard against a row that is already in the target.
    ///
    /// Stores that cannot push the condition into SQL use this directly.
    pub fn admits(&self, current: &Row) -> bool {
        match self {
            Guard::TimestampBefore { column, millis } => match current.get(column) {
                None | Some(Value::Null) => true,
                Some(value) => match parse_timestamp(value) {
                    Some(ts) => ts.timestamp_millis() < *millis,
                    None => true,
                },
            },
            Guard::VersionBelow { column, version } => {
                matches!(version_of(current, column), Some(current) if current < *version)
            }
        }
    }
}

/// Approval to write, with the conditions attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub write: WriteKind,
    pub guard: Option<Guard>,
    /// A create whose key already existed and went through the update rules
    pub reclassified: bool,
    /// Approved without enough information to decide
    pub fail_open: bool,
}

impl Approval {
    fn new(write: WriteKind, guard: Option<Guard>) -> Self {
        Self {
            write,
            guard,
            reclassified: false,
            fail_open: false,
        }
    }
}

/// Why an event was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "camelCase")]
pub enum Denial {
    /// Target row is at least as new as the event
    StaleTimestamp { event: Timestamp, target: Timestamp },
    /// Incoming version does not exceed the stored one
    StaleVersion { incoming: i64, current: i64 },
    /// A custom resolver said no
    Resolver { name: String },
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Denial::StaleTimestamp { event, target } => {
                write!(f, "target is newer ({target} >= {event})")
            }
            Denial::StaleVersion { incoming, current } => {
                write!(f, "version {incoming} does not exceed {current}")
            }
            Denial::Resolver { name } => write!(f, "denied by resolver '{name}'"),
        }
    }
}

/// Outcome of conflict resolution for one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Decision {
    Approve(Approval),
    Deny(Denial),
}

impl Decision {
    /// Approval used when the target state could not be read.
    pub fn fail_open(operation: Operation) -> Self {
        let write = match operation {
            Operation::Delete => WriteKind::Delete,
            Operation::Update => WriteKind::Update,
            Operation::Create | Operation::SnapshotRead => WriteKind::Upsert,
        };
        Decision::Approve(Approval {
            fail_open: true,
            ..Approval::new(write, None)
        })
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approve(_))
    }
}

/// Whether resolving `operation` requires the current target row.
pub fn needs_target_state(operation: Operation) -> bool {
    matches!(operation, Operation::Create | Operation::Update)
}

/// Everything a resolver may look at.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub event: &'a ChangeEvent,
    pub direction: Direction,
    /// The event's row, already mapped to the target's shape
    pub mapped: &'a Row,
    /// Current target row, if one exists
    pub target: Option<&'a Row>,
}

impl ResolveContext<'_> {
    pub fn target_system(&self) -> System {
        self.direction.target()
    }
}

/// Decide whether to apply an event.
///
/// `ctx.target` must hold the current target row for operations where
/// [`needs_target_state`] is true; it is ignored otherwise.
pub fn decide(
    ctx: &ResolveContext<'_>,
    strategy: &Strategy,
    resolvers: &ResolverRegistry,
) -> Result<Decision> {
    match ctx.event.operation {
        Operation::Delete => Ok(Decision::Approve(Approval::new(WriteKind::Delete, None))),
        Operation::SnapshotRead => Ok(Decision::Approve(Approval::new(WriteKind::Upsert, None))),
        Operation::Create if ctx.target.is_none() => {
            Ok(Decision::Approve(Approval::new(WriteKind::Insert, None)))
        }
        Operation::Create => decide_update(ctx, strategy, resolvers, true),
        Operation::Update => decide_update(ctx, strategy, resolvers, false),
    }
}

fn decide_update(
    ctx: &ResolveContext<'_>,
    strategy: &Strategy,
    resolvers: &ResolverRegistry,
    reclassified: bool,
) -> Result<Decision> {
    let write = if reclassified {
        WriteKind::Upsert
    } else {
        WriteKind::Update
    };
    let approve = |guard: Option<Guard>, fail_open: bool| {
        Decision::Approve(Approval {
            write,
            guard,
            reclassified,
            fail_open,
        })
    };

    match strategy {
        Strategy::Timestamp { column } => {
            let event_ts = ctx.event.event_timestamp_millis;
            let guard = Guard::TimestampBefore {
                column: column.clone(),
                millis: event_ts,
            };

            let current = match ctx.target.and_then(|row| row.get(column)) {
                None | Some(Value::Null) => return Ok(approve(Some(guard), false)),
                Some(value) => value,
            };
            let Some(target_ts) = parse_timestamp(current) else {
                return Ok(approve(None, true));
            };

            let target_ts = target_ts.timestamp_millis();
            if event_ts > target_ts {
                Ok(approve(Some(guard), false))
            } else {
                Ok(Decision::Deny(Denial::StaleTimestamp {
                    event: event_ts,
                    target: target_ts,
                }))
            }
        }
        Strategy::Version { column } => {
            let incoming = version_of(ctx.mapped, column).ok_or_else(|| Error::InvalidNumber {
                column: column.clone(),
                value: ctx.mapped.get(column).map(Value::to_string).unwrap_or_default(),
            })?;
            let guard = Guard::VersionBelow {
                column: column.clone(),
                version: incoming,
            };

            let Some(target) = ctx.target else {
                return Ok(approve(Some(guard), false));
            };
            let Some(current) = version_of(target, column) else {
                return Ok(approve(None, true));
            };

            if incoming > current {
                Ok(approve(Some(guard), false))
            } else {
                Ok(Decision::Deny(Denial::StaleVersion { incoming, current }))
            }
        }
        Strategy::Custom { resolver } => {
            let custom = resolvers
                .get(resolver)
                .ok_or_else(|| Error::UnknownResolver(resolver.clone()))?;
            if custom.resolve(ctx) {
                Ok(approve(None, false))
            } else {
                Ok(Decision::Deny(Denial::Resolver {
                    name: resolver.clone(),
                }))
            }
        }
    }
}

/// Read a version counter. Missing or null counts as 0; `None` means the value
/// is present but not a number.
fn version_of(row: &Row, column: &str) -> Option<i64> {
    match row.get(column) {
        None | Some(Value::Null) => Some(0),
        Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        Some(_) => None,
    }
}

/// A named, user supplied conflict resolver.
pub trait CustomResolver: Send + Sync {
    /// Return `true` to apply the event.
    fn resolve(&self, ctx: &ResolveContext<'_>) -> bool;
}

/// Approves only events that originate on the preferred system.
#[derive(Debug, Clone, Copy)]
pub struct SourcePriority {
    pub preferred: System,
}

impl CustomResolver for SourcePriority {
    fn resolve(&self, ctx: &ResolveContext<'_>) -> bool {
        ctx.direction.source() == self.preferred
    }
}

/// Custom resolvers by name.
#[derive(Clone, Default)]
pub struct ResolverRegistry {
    resolvers: HashMap<String, Arc<dyn CustomResolver>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in resolvers that apply to this process.
    pub fn with_source_priority(preferred: Option<System>) -> Self {
        let mut registry = Self::new();
        if let Some(preferred) = preferred {
            registry.register(SOURCE_PRIORITY, SourcePriority { preferred });
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, resolver: impl CustomResolver + 'static) {
        self.resolvers.insert(name.into(), Arc::new(resolver));
    }

    pub fn get(&self, name: &str) -> Option<&dyn CustomResolver> {
        self.resolvers.get(name).map(|r| r.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolvers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resolvers.keys().map(String::as_str)
    }
}

impl fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("ResolverRegistry")
            .field("resolvers", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn update(ts: Timestamp) -> ChangeEvent {
        ChangeEvent::new(Operation::Update, "mysql", "users", ts).with_after(Row::new())
    }

    fn timestamp() -> Strategy {
        Strategy::Timestamp {
            column: "updated_at".into(),
        }
    }

    fn version() -> Strategy {
        Strategy::Version {
            column: "version".into(),
        }
    }

    fn ctx<'a>(event: &'a ChangeEvent, mapped: &'a Row, target: Option<&'a Row>) -> ResolveContext<'a> {
        ResolveContext {
            event,
            direction: Direction::AToB,
            mapped,
            target,
        }
    }

    #[test]
    fn deletes_and_snapshots_always_apply() {
        let registry = ResolverRegistry::new();
        let mapped = Row::new();

        let delete = ChangeEvent::new(Operation::Delete, "mysql", "users", 1).with_before(Row::new());
        let decision = decide(&ctx(&delete, &mapped, None), &timestamp(), &registry).unwrap();
        assert!(matches!(decision, Decision::Approve(Approval { write: WriteKind::Delete, guard: None, .. })));

        let snapshot = ChangeEvent::snapshot("mysql", "users", Row::new(), 1);
        let newer = row(json!({"updated_at": "2999-01-01T00:00:00Z"}));
        let decision = decide(&ctx(&snapshot, &mapped, Some(&newer)), &timestamp(), &registry).unwrap();
        assert!(matches!(decision, Decision::Approve(Approval { write: WriteKind::Upsert, guard: None, .. })));
    }

    #[test]
    fn create_inserts_when_absent_and_reclassifies_when_present() {
        let registry = ResolverRegistry::new();
        let mapped = Row::new();
        let create = ChangeEvent::new(Operation::Create, "mysql", "users", 200).with_after(Row::new());

        let decision = decide(&ctx(&create, &mapped, None), &timestamp(), &registry).unwrap();
        assert_eq!(
            decision,
            Decision::Approve(Approval::new(WriteKind::Insert, None))
        );

        let existing = row(json!({"id": 1, "updated_at": 100}));
        match decide(&ctx(&create, &mapped, Some(&existing)), &timestamp(), &registry).unwrap() {
            Decision::Approve(approval) => {
                assert_eq!(approval.write, WriteKind::Upsert);
                assert!(approval.reclassified);
                assert_eq!(
                    approval.guard,
                    Some(Guard::TimestampBefore {
                        column: "updated_at".into(),
                        millis: 200
                    })
                );
            }
            other => panic!("expected approval, got {other:?}"),
        }

        let newer = row(json!({"id": 1, "updated_at": 300}));
        assert!(!decide(&ctx(&create, &mapped, Some(&newer)), &timestamp(), &registry)
            .unwrap()
            .is_approved());
    }

    #[test]
    fn stale_timestamp_denied() {
        let registry = ResolverRegistry::new();
        let mapped = Row::new();
        let target = row(json!({"id": 5, "updated_at": 100}));
        let event = update(90);

        let decision = decide(&ctx(&event, &mapped, Some(&target)), &timestamp(), &registry).unwrap();
        assert_eq!(
            decision,
            Decision::Deny(Denial::StaleTimestamp {
                event: 90,
                target: 100
            })
        );

        // equal timestamps are not strictly newer
        let event = update(100);
        assert!(!decide(&ctx(&event, &mapped, Some(&target)), &timestamp(), &registry)
            .unwrap()
            .is_approved());
    }

    #[test]
    fn timestamp_compares_formatted_values() {
        let registry = ResolverRegistry::new();
        let mapped = Row::new();
        let target = row(json!({"updated_at": "2024-01-01 00:00:00"}));

        let older = update(1704067199000);
        let newer = update(1704067201000);
        assert!(!decide(&ctx(&older, &mapped, Some(&target)), &timestamp(), &registry)
            .unwrap()
            .is_approved());
        assert!(decide(&ctx(&newer, &mapped, Some(&target)), &timestamp(), &registry)
            .unwrap()
            .is_approved());
    }

    #[test]
    fn unparseable_target_timestamp_fails_open() {
        let registry = ResolverRegistry::new();
        let mapped = Row::new();
        let target = row(json!({"updated_at": "garbage"}));
        let event = update(1);

        match decide(&ctx(&event, &mapped, Some(&target)), &timestamp(), &registry).unwrap() {
            Decision::Approve(approval) => {
                assert!(approval.fail_open);
                assert!(approval.guard.is_none());
            }
            other => panic!("expected approval, got {other:?}"),
        }
    }

    #[test]
    fn version_strategy() {
        let registry = ResolverRegistry::new();
        let event = update(1);
        let target = row(json!({"version": 3}));

        let higher = row(json!({"version": 4}));
        match decide(&ctx(&event, &higher, Some(&target)), &version(), &registry).unwrap() {
            Decision::Approve(approval) => assert_eq!(
                approval.guard,
                Some(Guard::VersionBelow {
                    column: "version".into(),
                    version: 4
                })
            ),
            other => panic!("expected approval, got {other:?}"),
        }

        let same = row(json!({"version": "3"}));
        assert_eq!(
            decide(&ctx(&event, &same, Some(&target)), &version(), &registry).unwrap(),
            Decision::Deny(Denial::StaleVersion {
                incoming: 3,
                current: 3
            })
        );

        // both default to zero
        let unversioned = Row::new();
        assert!(!decide(&ctx(&event, &unversioned, Some(&Row::new())), &version(), &registry)
            .unwrap()
            .is_approved());

        let broken = row(json!({"version": "three"}));
        assert!(matches!(
            decide(&ctx(&event, &broken, Some(&target)), &version(), &registry),
            Err(Error::InvalidNumber { .. })
        ));
    }

    #[test]
    fn custom_resolvers() {
        let registry = ResolverRegistry::with_source_priority(Some(System::B));
        let strategy = Strategy::Custom {
            resolver: SOURCE_PRIORITY.into(),
        };
        let event = update(1);
        let mapped = Row::new();

        let from_a = ctx(&event, &mapped, None);
        assert_eq!(
            decide(&from_a, &strategy, &registry).unwrap(),
            Decision::Deny(Denial::Resolver {
                name: SOURCE_PRIORITY.into()
            })
        );

        let from_b = ResolveContext {
            direction: Direction::BToA,
            ..from_a
        };
        assert!(decide(&from_b, &strategy, &registry).unwrap().is_approved());

        let missing = Strategy::Custom {
            resolver: "nope".into(),
        };
        assert!(matches!(
            decide(&from_a, &missing, &registry),
            Err(Error::UnknownResolver(name)) if name == "nope"
        ));
        assert!(!ResolverRegistry::with_source_priority(None).contains(SOURCE_PRIORITY));
    }

    #[test]
    fn guards_evaluate_against_current_rows() {
        let ts = Guard::TimestampBefore {
            column: "updated_at".into(),
            millis: 100,
        };
        assert!(ts.admits(&row(json!({"updated_at": 99}))));
        assert!(!ts.admits(&row(json!({"updated_at": 100}))));
        assert!(ts.admits(&row(json!({"updated_at": null}))));

        let v = Guard::VersionBelow {
            column: "version".into(),
            version: 2,
        };
        assert!(v.admits(&row(json!({"version": 1}))));
        assert!(v.admits(&Row::new()));
        assert!(!v.admits(&row(json!({"version": 2}))));
    }

    #[test]
    fn fail_open_decisions() {
        for (op, write) in [
            (Operation::Create, WriteKind::Upsert),
            (Operation::Update, WriteKind::Update),
            (Operation::Delete, WriteKind::Delete),
        ] {
            match Decision::fail_open(op) {
                Decision::Approve(approval) => {
                    assert_eq!(approval.write, write);
                    assert!(approval.fail_open);
                    assert!(approval.guard.is_none());
                }
                other => panic!("expected approval, got {other:?}"),
            }
        }
        assert!(needs_target_state(Operation::Create));
        assert!(!needs_target_state(Operation::SnapshotRead));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// The later of two updates always survives, whichever arrives first.
            #[test]
            fn prop_timestamp_law(t1 in 0i64..1_000_000, delta in 1i64..1_000_000) {
                let t2 = t1 + delta;
                let registry = ResolverRegistry::new();
                let mapped = Row::new();

                let applied_t2 = row(json!({"updated_at": t2}));
                let late = update(t1);
                let decision = decide(&ctx(&late, &mapped, Some(&applied_t2)), &timestamp(), &registry).unwrap();
                prop_assert!(!decision.is_approved());

                let applied_t1 = row(json!({"updated_at": t1}));
                let fresh = update(t2);
                let decision = decide(&ctx(&fresh, &mapped, Some(&applied_t1)), &timestamp(), &registry).unwrap();
                prop_assert!(decision.is_approved());
            }

            #[test]
            fn prop_version_law(v1 in 0i64..1_000_000, delta in 1i64..1_000_000) {
                let v2 = v1 + delta;
                let registry = ResolverRegistry::new();
                let event = update(0);

                let stored_v2 = row(json!({"version": v2}));
                let incoming_v1 = row(json!({"version": v1}));
                let decision = decide(&ctx(&event, &incoming_v1, Some(&stored_v2)), &version(), &registry).unwrap();
                prop_assert!(!decision.is_approved());

                let decision = decide(&ctx(&event, &stored_v2, Some(&incoming_v1)), &version(), &registry).unwrap();
                prop_assert!(decision.is_approved());
            }

            /// A guard admits a write exactly when the decision would approve it.
            #[test]
            fn prop_guard_matches_decision(current in 0i64..1_000, incoming in 0i64..1_000) {
                let guard = Guard::VersionBelow { column: "version".into(), version: incoming };
                prop_assert_eq!(guard.admits(&row(json!({"version": current}))), incoming > current);
            }
        }
    }
}
