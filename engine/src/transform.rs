//! Column-level and table-level transformations.
//!
//! Column transforms rewrite a single coerced value. Table transforms run after
//! every column has been mapped and derive one target column from already
//! mapped target values.

use crate::{error::Result, ColumnName, Error, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Transform applied to a single column after coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnTransform {
    Uppercase,
    Lowercase,
    Trim,
    /// Strip the separators from a hyphenated identifier
    UuidToBinary,
    /// Insert separators into a 32-digit identifier
    BinaryToUuid,
}

impl std::fmt::Display for ColumnTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ColumnTransform::Uppercase => "uppercase",
            ColumnTransform::Lowercase => "lowercase",
            ColumnTransform::Trim => "trim",
            ColumnTransform::UuidToBinary => "uuid_to_binary",
            ColumnTransform::BinaryToUuid => "binary_to_uuid",
        };
        f.write_str(name)
    }
}

impl ColumnTransform {
    /// The transform that undoes this one, if any.
    pub fn inverse(self) -> Option<Self> {
        match self {
            ColumnTransform::Uppercase => Some(ColumnTransform::Lowercase),
            ColumnTransform::Lowercase => Some(ColumnTransform::Uppercase),
            ColumnTransform::UuidToBinary => Some(ColumnTransform::BinaryToUuid),
            ColumnTransform::BinaryToUuid => Some(ColumnTransform::UuidToBinary),
            ColumnTransform::Trim => None,
        }
    }

    /// Apply the transform. Non-string values pass through the text
    /// transforms untouched.
    pub fn apply(self, value: &Value, column: &str) -> Result<Value> {
        let Some(text) = value.as_str() else {
            return match (self, value) {
                (_, Value::Null) => Ok(Value::Null),
                (ColumnTransform::UuidToBinary | ColumnTransform::BinaryToUuid, other) => {
                    Err(Error::InvalidUuid {
                        column: column.to_string(),
                        value: other.to_string(),
                    })
                }
                (_, other) => Ok(other.clone()),
            };
        };

        let out = match self {
            ColumnTransform::Uppercase => text.to_uppercase(),
            ColumnTransform::Lowercase => text.to_lowercase(),
            ColumnTransform::Trim => text.trim().to_string(),
            ColumnTransform::UuidToBinary | ColumnTransform::BinaryToUuid => {
                let id = uuid::Uuid::parse_str(text.trim()).map_err(|_| Error::InvalidUuid {
                    column: column.to_string(),
                    value: text.to_string(),
                })?;
                if self == ColumnTransform::UuidToBinary {
                    id.simple().to_string()
                } else {
                    id.hyphenated().to_string()
                }
            }
        };
        Ok(Value::String(out))
    }
}

fn default_separator() -> String {
    " ".to_string()
}

/// Transform that derives one target column from mapped target values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TableTransform {
    /// Join several mapped columns with a separator
    Concat {
        column: ColumnName,
        fields: Vec<ColumnName>,
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Write a fixed value
    Constant { column: ColumnName, value: Value },
    /// Translate a mapped value through a static lookup table
    Lookup {
        column: ColumnName,
        #[serde(rename = "sourceField", alias = "source_field")]
        source_field: ColumnName,
        table: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<Value>,
    },
}

impl TableTransform {
    /// The target column this transform writes.
    pub fn column(&self) -> &str {
        match self {
            TableTransform::Concat { column, .. }
            | TableTransform::Constant { column, .. }
            | TableTransform::Lookup { column, .. } => column,
        }
    }

    /// Target columns this transform reads.
    pub fn inputs(&self) -> Vec<&str> {
        match self {
            TableTransform::Concat { fields, .. } => fields.iter().map(String::as_str).collect(),
            TableTransform::Constant { .. } => Vec::new(),
            TableTransform::Lookup { source_field, .. } => vec![source_field.as_str()],
        }
    }

    /// Short human readable description used in diagnostics.
    pub fn describe(&self) -> String {
        match self {
            TableTransform::Concat { column, .. } => format!("concat into {column}"),
            TableTransform::Constant { column, .. } => format!("constant into {column}"),
            TableTransform::Lookup { column, table, .. } => {
                format!("lookup {table} into {column}")
            }
        }
    }

    /// Compute the value for [`column`](Self::column) from the mapped row.
    pub fn apply(&self, row: &Row, lookups: &LookupTables) -> Result<Value> {
        match self {
            TableTransform::Concat {
                column,
                fields,
                separator,
            } => {
                let mut parts = Vec::with_capacity(fields.len());
                for field in fields {
                    let value = row.get(field).ok_or_else(|| Error::UnmappedTransformInput {
                        column: column.clone(),
                        input: field.clone(),
                    })?;
                    parts.push(text_of(value));
                }
                Ok(Value::String(parts.join(separator)))
            }
            TableTransform::Constant { value, .. } => Ok(value.clone()),
            TableTransform::Lookup {
                column,
                source_field,
                table,
                default,
            } => {
                let key = row
                    .get(source_field)
                    .ok_or_else(|| Error::UnmappedTransformInput {
                        column: column.clone(),
                        input: source_field.clone(),
                    })?;
                if key.is_null() {
                    return Ok(default.clone().unwrap_or(Value::Null));
                }

                let key = text_of(key);
                match lookups.get(table, &key)? {
                    Some(found) => Ok(found.clone()),
                    None => default.clone().ok_or_else(|| Error::LookupMiss {
                        table: table.clone(),
                        key,
                    }),
                }
            }
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Static cross-reference tables used by lookup transforms.
///
/// Keys are matched on their text form, so `1` and `"1"` hit the same entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LookupTables(HashMap<String, BTreeMap<String, Value>>);

impl LookupTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a lookup table.
    pub fn insert(&mut self, name: impl Into<String>, entries: BTreeMap<String, Value>) {
        self.0.insert(name.into(), entries);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Look a key up. Fails only when the table itself is unknown.
    pub fn get(&self, table: &str, key: &str) -> Result<Option<&Value>> {
        self.0
            .get(table)
            .map(|entries| entries.get(key))
            .ok_or_else(|| Error::UnknownLookupTable(table.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
