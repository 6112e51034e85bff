//! Declarative table mappings.
//!
//! A [`TableMapping`] is directed: it describes how rows of one source table
//! become rows of one target table on the other system. Reverse mappings are
//! derived mechanically by [`TableMapping::reverse`] and refuse to guess when a
//! transform has no inverse.

use crate::{
    conflict::Strategy,
    error::Result,
    transform::{ColumnTransform, LookupTables, TableTransform},
    ColumnName, Direction, Error, Row, SemanticType, System, TableName,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;

fn default_true() -> bool {
    true
}

fn default_primary_key() -> Vec<ColumnName> {
    vec!["id".to_string()]
}

/// How one source column becomes one target column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub source: ColumnName,
    pub target: ColumnName,
    #[serde(rename = "type")]
    pub semantic_type: SemanticType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ColumnTransform>,
    #[serde(default = "default_true")]
    pub nullable: bool,
}

impl ColumnMapping {
    pub fn new(
        source: impl Into<ColumnName>,
        target: impl Into<ColumnName>,
        semantic_type: SemanticType,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            semantic_type,
            transform: None,
            nullable: true,
        }
    }

    pub fn with_transform(mut self, transform: ColumnTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// Conflict strategy names accepted in mapping documents and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Event capture time must be newer than the target's timestamp column
    #[default]
    Timestamp,
    /// Row version must be strictly greater than the target's
    Version,
    /// Delegate to a named resolver
    Custom,
}

impl std::str::FromStr for StrategyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "timestamp" => Ok(StrategyKind::Timestamp),
            "version" => Ok(StrategyKind::Version),
            "custom" => Ok(StrategyKind::Custom),
            other => Err(Error::InvalidDocument(format!(
                "unknown conflict resolution strategy '{other}'"
            ))),
        }
    }
}

/// Per-table conflict resolution settings.
///
/// Column names refer to the target table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolutionConfig {
    pub strategy: StrategyKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_column: Option<ColumnName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_column: Option<ColumnName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_resolver: Option<String>,
}

impl ConflictResolutionConfig {
    pub fn timestamp(column: impl Into<ColumnName>) -> Self {
        Self {
            strategy: StrategyKind::Timestamp,
            timestamp_column: Some(column.into()),
            ..Self::default()
        }
    }

    pub fn version(column: impl Into<ColumnName>) -> Self {
        Self {
            strategy: StrategyKind::Version,
            version_column: Some(column.into()),
            ..Self::default()
        }
    }

    pub fn custom(resolver: impl Into<String>) -> Self {
        Self {
            strategy: StrategyKind::Custom,
            custom_resolver: Some(resolver.into()),
            ..Self::default()
        }
    }
}

/// Source side of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSpec {
    #[serde(alias = "database")]
    pub system: System,
    pub table: TableName,
    pub columns: Vec<ColumnMapping>,
}

/// Target side of a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    #[serde(alias = "database")]
    pub system: System,
    pub table: TableName,
}

/// Directed mapping from one source table to one target table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMapping {
    pub source: SourceSpec,
    pub target: TargetSpec,
    /// Table-level transforms, applied in order after column mapping
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transformations: Vec<TableTransform>,
    /// Source columns that are never copied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_columns: Vec<ColumnName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_resolution: Option<ConflictResolutionConfig>,
    /// Target-side key columns
    #[serde(default = "default_primary_key")]
    pub primary_key: Vec<ColumnName>,
    /// Whether a reverse mapping should be derived
    #[serde(default = "default_true")]
    pub bidirectional: bool,
}

impl TableMapping {
    /// A mapping with no columns yet, keyed on `id`.
    pub fn new(
        source_system: System,
        source_table: impl Into<TableName>,
        target_table: impl Into<TableName>,
    ) -> Self {
        Self {
            source: SourceSpec {
                system: source_system,
                table: source_table.into(),
                columns: Vec::new(),
            },
            target: TargetSpec {
                system: source_system.opposite(),
                table: target_table.into(),
            },
            transformations: Vec::new(),
            skip_columns: Vec::new(),
            conflict_resolution: None,
            primary_key: default_primary_key(),
            bidirectional: true,
        }
    }

    pub fn column(
        self,
        source: impl Into<ColumnName>,
        target: impl Into<ColumnName>,
        semantic_type: SemanticType,
    ) -> Self {
        self.with_column(ColumnMapping::new(source, target, semantic_type))
    }

    pub fn with_column(mut self, column: ColumnMapping) -> Self {
        self.source.columns.push(column);
        self
    }

    pub fn with_transformation(mut self, transform: TableTransform) -> Self {
        self.transformations.push(transform);
        self
    }

    pub fn skip(mut self, column: impl Into<ColumnName>) -> Self {
        self.skip_columns.push(column.into());
        self
    }

    pub fn with_conflict_resolution(mut self, config: ConflictResolutionConfig) -> Self {
        self.conflict_resolution = Some(config);
        self
    }

    pub fn with_primary_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ColumnName>,
    {
        self.primary_key = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Do not derive a reverse for this mapping.
    pub fn one_way(mut self) -> Self {
        self.bidirectional = false;
        self
    }

    pub fn direction(&self) -> Direction {
        Direction::from_source(self.source.system)
    }

    /// Resolve the conflict strategy, falling back to `default` when the
    /// mapping declares none.
    pub fn strategy(&self, default: StrategyKind) -> Result<Strategy> {
        let config = self.conflict_resolution.clone().unwrap_or(ConflictResolutionConfig {
            strategy: default,
            ..ConflictResolutionConfig::default()
        });

        match config.strategy {
            StrategyKind::Timestamp => Ok(Strategy::Timestamp {
                column: config
                    .timestamp_column
                    .unwrap_or_else(|| "updated_at".to_string()),
            }),
            StrategyKind::Version => Ok(Strategy::Version {
                column: config.version_column.unwrap_or_else(|| "version".to_string()),
            }),
            StrategyKind::Custom => config
                .custom_resolver
                .map(|resolver| Strategy::Custom { resolver })
                .ok_or_else(|| self.invalid("custom strategy without customResolver")),
        }
    }

    /// Check structural rules against the lookup tables that will be in scope.
    pub fn validate(&self, lookups: &LookupTables) -> Result<()> {
        if self.source.system == self.target.system {
            return Err(self.invalid("source and target are the same system"));
        }
        if self.source.columns.is_empty() {
            return Err(self.invalid("no column mappings"));
        }

        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for column in &self.source.columns {
            if !sources.insert(column.source.as_str()) {
                return Err(self.invalid(&format!("duplicate source column '{}'", column.source)));
            }
            if !targets.insert(column.target.as_str()) {
                return Err(self.invalid(&format!("duplicate target column '{}'", column.target)));
            }
        }

        let mut produced: HashSet<&str> = self
            .source
            .columns
            .iter()
            .filter(|c| !self.skip_columns.contains(&c.source))
            .map(|c| c.target.as_str())
            .collect();

        if self.primary_key.is_empty() {
            return Err(self.invalid("empty primary key"));
        }
        for key in &self.primary_key {
            if !produced.contains(key.as_str()) {
                return Err(self.invalid(&format!(
                    "primary key column '{key}' is not produced by a column mapping"
                )));
            }
        }

        for transform in &self.transformations {
            for input in transform.inputs() {
                if !produced.contains(input) {
                    return Err(Error::UnmappedTransformInput {
                        column: transform.column().to_string(),
                        input: input.to_string(),
                    });
                }
            }
            if let TableTransform::Lookup { table, .. } = transform {
                if !lookups.contains(table) {
                    return Err(Error::UnknownLookupTable(table.clone()));
                }
            }
            produced.insert(transform.column());
        }

        if let Some(config) = &self.conflict_resolution {
            if config.strategy == StrategyKind::Custom && config.custom_resolver.is_none() {
                return Err(self.invalid("custom strategy without customResolver"));
            }
        }

        Ok(())
    }

    /// Extract the primary key from a mapped (target-shaped) row.
    pub fn key_of(&self, row: &Row) -> Result<PrimaryKey> {
        let mut parts = Vec::with_capacity(self.primary_key.len());
        for column in &self.primary_key {
            match row.get(column) {
                Some(value) if !value.is_null() => parts.push((column.clone(), value.clone())),
                _ => {
                    return Err(Error::MissingPrimaryKey {
                        table: self.target.table.clone(),
                        column: column.clone(),
                    })
                }
            }
        }
        Ok(PrimaryKey(parts))
    }

    /// Derive the mapping for the opposite direction.
    ///
    /// Fails with [`Error::NonInvertibleMapping`] naming every transform that
    /// cannot be undone.
    pub fn reverse(&self) -> Result<TableMapping> {
        let mut offending = Vec::new();
        let mut columns = Vec::with_capacity(self.source.columns.len());

        for column in &self.source.columns {
            let transform = match column.transform {
                None => None,
                Some(t) => match t.inverse() {
                    Some(inverse) => Some(inverse),
                    None => {
                        offending.push(format!("{t} on {}", column.source));
                        None
                    }
                },
            };
            columns.push(ColumnMapping {
                source: column.target.clone(),
                target: column.source.clone(),
                semantic_type: column.semantic_type,
                transform,
                nullable: column.nullable,
            });
        }
        offending.extend(self.transformations.iter().map(TableTransform::describe));

        if !offending.is_empty() {
            return Err(Error::NonInvertibleMapping {
                mapping: self.to_string(),
                transforms: offending,
            });
        }

        let to_source: HashMap<&str, &str> = self
            .source
            .columns
            .iter()
            .map(|c| (c.target.as_str(), c.source.as_str()))
            .collect();
        let from_source: HashMap<&str, &str> = self
            .source
            .columns
            .iter()
            .map(|c| (c.source.as_str(), c.target.as_str()))
            .collect();

        let conflict_resolution =
            self.conflict_resolution
                .as_ref()
                .map(|c| ConflictResolutionConfig {
                    strategy: c.strategy,
                    timestamp_column: c.timestamp_column.as_deref().map(|n| rename(&to_source, n)),
                    version_column: c.version_column.as_deref().map(|n| rename(&to_source, n)),
                    custom_resolver: c.custom_resolver.clone(),
                });

        Ok(TableMapping {
            source: SourceSpec {
                system: self.target.system,
                table: self.target.table.clone(),
                columns,
            },
            target: TargetSpec {
                system: self.source.system,
                table: self.source.table.clone(),
            },
            transformations: Vec::new(),
            skip_columns: self
                .skip_columns
                .iter()
                .map(|c| rename(&from_source, c))
                .collect(),
            conflict_resolution,
            primary_key: self
                .primary_key
                .iter()
                .map(|c| rename(&to_source, c))
                .collect(),
            bidirectional: false,
        })
    }

    fn invalid(&self, reason: &str) -> Error {
        Error::InvalidMapping {
            mapping: self.to_string(),
            reason: reason.to_string(),
        }
    }
}

fn rename(map: &HashMap<&str, &str>, name: &str) -> ColumnName {
    map.get(name).copied().unwrap_or(name).to_string()
}

impl fmt::Display for TableMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source.system, self.source.table, self.target.system, self.target.table
        )
    }
}

/// Primary key values of one mapped row, in declared column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryKey(Vec<(ColumnName, Value)>);

impl PrimaryKey {
    pub fn new(parts: Vec<(ColumnName, Value)>) -> Self {
        Self(parts)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(c, _)| c.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(c, v)| (c.as_str(), v))
    }

    /// Whether `row` carries exactly these key values.
    pub fn matches(&self, row: &Row) -> bool {
        self.0.iter().all(|(c, v)| row.get(c) == Some(v))
    }

    /// Key values joined with `:`; used for partitioning and message keys.
    pub fn key_string(&self) -> String {
        self.0
            .iter()
            .map(|(_, v)| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (column, value)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{column}={value}")?;
        }
        Ok(())
    }
}
