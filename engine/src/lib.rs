//! # Rowsync Engine
//!
//! The deterministic core of a bidirectional change-data-capture sync between
//! two relational databases, "System A" and "System B".
//!
//! This crate decides *what* to write; it never talks to a database or a
//! message broker. The server crate feeds it change events and current target
//! rows, and executes the writes it approves.
//!
//! ## Design Principles
//!
//! - **No IO**: events, rows and target state are passed in as values
//! - **Deterministic**: the same event and target state give the same decision
//! - **Closed vocabularies**: types, transforms and strategies are enums, and
//!   unknown names are rejected when mappings are loaded
//!
//! ## Pipeline
//!
//! 1. [`ChangeEvent::decode`] turns a capture envelope into an event
//! 2. [`LoopGuard::is_own`] drops echoes of this engine's own writes
//! 3. [`MappingRegistry::get_mapping`] finds the [`TableMapping`]
//! 4. [`map_event`] coerces and transforms the row for the target system
//! 5. [`decide`] applies the conflict rules to the current target row
//! 6. The caller writes the row, honouring the returned [`Guard`]
//! 7. A [`SyncOutcomeEvent`] records the result
//!
//! ## Quick Start
//!
//! ```rust
//! use rowsync_engine::{
//!     map_event, ChangeEvent, Direction, MappingRegistry, Operation, SemanticType,
//!     System, SystemNames, TableMapping,
//! };
//! use serde_json::json;
//!
//! let mut registry = MappingRegistry::new(SystemNames::default());
//! registry
//!     .register_mapping(
//!         TableMapping::new(System::A, "users", "users")
//!             .column("id", "id", SemanticType::Integer)
//!             .column("is_active", "active", SemanticType::Boolean),
//!     )
//!     .unwrap();
//! registry.derive_reverse_mappings().unwrap();
//!
//! let row = json!({"id": 1, "is_active": 1}).as_object().cloned().unwrap();
//! let event = ChangeEvent::new(Operation::Create, "mysql", "users", 1_700_000_000_000)
//!     .with_after(row);
//!
//! let mapping = registry.get_mapping(&event.source_system, &event.source_table).unwrap();
//! let mapped = map_event(&event, mapping, Direction::AToB, registry.lookups()).unwrap();
//! assert_eq!(mapped.values["active"], json!(true));
//! ```

pub mod conflict;
pub mod error;
pub mod event;
pub mod guard;
pub mod mapper;
pub mod mapping;
pub mod outcome;
pub mod registry;
pub mod transform;
pub mod types;

// Re-export main types at crate root
pub use conflict::{
    decide, needs_target_state, Approval, CustomResolver, Decision, Denial, Guard,
    ResolveContext, ResolverRegistry, SourcePriority, Strategy, WriteKind, SOURCE_PRIORITY,
};
pub use error::Error;
pub use event::{ChangeEvent, Direction, Operation, System, TransactionInfo};
pub use guard::LoopGuard;
pub use mapper::{map_event, map_row, MappedRow};
pub use mapping::{
    ColumnMapping, ConflictResolutionConfig, PrimaryKey, SourceSpec, StrategyKind, TableMapping,
    TargetSpec,
};
pub use outcome::{OutcomeStatus, SyncOutcomeEvent};
pub use registry::{MappingDocument, MappingRegistry, SystemNames};
pub use transform::{ColumnTransform, LookupTables, TableTransform};
pub use types::SemanticType;

/// Type aliases for clarity
pub type Row = serde_json::Map<String, serde_json::Value>;
pub type TableName = String;
pub type ColumnName = String;
/// Milliseconds since the Unix epoch
pub type Timestamp = i64;
