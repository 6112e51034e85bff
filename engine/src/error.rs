//! Error types for the rowsync engine.

use crate::{ColumnName, TableName};
use thiserror::Error;

/// All possible errors from the rowsync engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Event errors
    #[error("invalid change event: {0}")]
    InvalidEvent(String),

    // Per-event mapping errors
    #[error("invalid JSON in column '{column}': {reason}")]
    InvalidJson { column: ColumnName, reason: String },

    #[error("invalid numeric value in column '{column}': {value}")]
    InvalidNumber { column: ColumnName, value: String },

    #[error("invalid timestamp in column '{column}': {value}")]
    InvalidTimestamp { column: ColumnName, value: String },

    #[error("invalid uuid in column '{column}': {value}")]
    InvalidUuid { column: ColumnName, value: String },

    #[error("invalid boolean in column '{column}': {value}")]
    InvalidBoolean { column: ColumnName, value: String },

    #[error("column '{column}' is not nullable")]
    NullInNonNullable { column: ColumnName },

    #[error("transformation for '{column}' reads unmapped column '{input}'")]
    UnmappedTransformInput {
        column: ColumnName,
        input: ColumnName,
    },

    #[error("lookup table '{table}' has no entry for '{key}'")]
    LookupMiss { table: String, key: String },

    #[error("row for table '{table}' is missing primary key column '{column}'")]
    MissingPrimaryKey {
        table: TableName,
        column: ColumnName,
    },

    // Configuration errors
    #[error("invalid mapping {mapping}: {reason}")]
    InvalidMapping { mapping: String, reason: String },

    #[error("mapping {mapping} cannot be reversed; no inverse for: {}", transforms.join(", "))]
    NonInvertibleMapping {
        mapping: String,
        transforms: Vec<String>,
    },

    #[error("unknown custom resolver: {0}")]
    UnknownResolver(String),

    #[error("unknown lookup table: {0}")]
    UnknownLookupTable(String),

    #[error("invalid mapping document: {0}")]
    InvalidDocument(String),
}

impl Error {
    /// Whether this error is scoped to a single event.
    ///
    /// Mapping errors are terminal for the event that produced them: they are
    /// counted and the feed position still advances.
    pub fn is_mapping_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidEvent(_)
                | Error::InvalidJson { .. }
                | Error::InvalidNumber { .. }
                | Error::InvalidTimestamp { .. }
                | Error::InvalidUuid { .. }
                | Error::InvalidBoolean { .. }
                | Error::NullInNonNullable { .. }
                | Error::UnmappedTransformInput { .. }
                | Error::LookupMiss { .. }
                | Error::MissingPrimaryKey { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
