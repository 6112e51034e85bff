//! Semantic column types and value coercion.
//!
//! Each semantic type has one representation per system. Coercion accepts
//! either representation and emits the one the target system expects, so a
//! value that travels A → B → A comes back unchanged.
//!
//! | type      | System A                  | System B             |
//! |-----------|---------------------------|----------------------|
//! | boolean   | `0` / `1`                 | `false` / `true`     |
//! | timestamp | `YYYY-MM-DD HH:MM:SS[.f]` | RFC 3339, UTC (`Z`)  |
//! | json      | serialized text           | structured value     |
//! | decimal   | decimal literal string    | floating number      |
//! | uuid      | 32 hex digits             | hyphenated           |

use crate::{error::Result, Error, System};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Semantic type of a mapped column.
///
/// Database-specific names are accepted as aliases when mappings are loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticType {
    #[serde(alias = "int", alias = "bigint", alias = "smallint", alias = "serial")]
    Integer,
    #[serde(alias = "varchar", alias = "char", alias = "string")]
    Text,
    #[serde(alias = "tinyint", alias = "bool")]
    Boolean,
    #[serde(alias = "datetime", alias = "timestamptz")]
    Timestamp,
    #[serde(alias = "jsonb")]
    Json,
    #[serde(alias = "numeric")]
    Decimal,
    #[serde(alias = "double", alias = "real")]
    Float,
    Uuid,
}

impl std::fmt::Display for SemanticType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SemanticType::Integer => write!(f, "integer"),
            SemanticType::Text => write!(f, "text"),
            SemanticType::Boolean => write!(f, "boolean"),
            SemanticType::Timestamp => write!(f, "timestamp"),
            SemanticType::Json => write!(f, "json"),
            SemanticType::Decimal => write!(f, "decimal"),
            SemanticType::Float => write!(f, "float"),
            SemanticType::Uuid => write!(f, "uuid"),
        }
    }
}

impl SemanticType {
    /// Coerce `value` into the representation `target` expects.
    ///
    /// `column` is only used for error messages. Null is preserved.
    pub fn coerce(self, value: &Value, target: System, column: &str) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }

        match self {
            SemanticType::Integer | SemanticType::Text => Ok(value.clone()),
            SemanticType::Boolean => {
                let flag = parse_bool(value).ok_or_else(|| Error::InvalidBoolean {
                    column: column.to_string(),
                    value: value.to_string(),
                })?;
                Ok(match target {
                    System::A => Value::from(i64::from(flag)),
                    System::B => Value::Bool(flag),
                })
            }
            SemanticType::Timestamp => {
                let ts = parse_timestamp(value).ok_or_else(|| Error::InvalidTimestamp {
                    column: column.to_string(),
                    value: value.to_string(),
                })?;
                Ok(Value::String(format_timestamp(ts, target)))
            }
            SemanticType::Json => coerce_json(value, target, column),
            SemanticType::Decimal => coerce_decimal(value, target, column),
            SemanticType::Float => {
                let n = parse_number(value).ok_or_else(|| invalid_number(column, value))?;
                finite_number(n).ok_or_else(|| invalid_number(column, value))
            }
            SemanticType::Uuid => {
                let id = value
                    .as_str()
                    .and_then(|s| uuid::Uuid::parse_str(s.trim()).ok())
                    .ok_or_else(|| Error::InvalidUuid {
                        column: column.to_string(),
                        value: value.to_string(),
                    })?;
                Ok(Value::String(match target {
                    System::A => id.simple().to_string(),
                    System::B => id.hyphenated().to_string(),
                }))
            }
        }
    }
}

fn coerce_json(value: &Value, target: System, column: &str) -> Result<Value> {
    match (value, target) {
        (Value::String(text), System::A) => {
            serde_json::from_str::<Value>(text).map_err(|e| Error::InvalidJson {
                column: column.to_string(),
                reason: e.to_string(),
            })?;
            Ok(value.clone())
        }
        (Value::String(text), System::B) => {
            serde_json::from_str(text).map_err(|e| Error::InvalidJson {
                column: column.to_string(),
                reason: e.to_string(),
            })
        }
        (structured, System::A) => Ok(Value::String(structured.to_string())),
        (structured, System::B) => Ok(structured.clone()),
    }
}

fn coerce_decimal(value: &Value, target: System, column: &str) -> Result<Value> {
    let n = parse_number(value).ok_or_else(|| invalid_number(column, value))?;
    if !n.is_finite() {
        return Err(invalid_number(column, value));
    }

    match target {
        // Keep the literal when there is one so DECIMAL precision survives.
        System::A => Ok(Value::String(match value {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })),
        System::B => finite_number(n).ok_or_else(|| invalid_number(column, value)),
    }
}

fn invalid_number(column: &str, value: &Value) -> Error {
    Error::InvalidNumber {
        column: column.to_string(),
        value: value.to_string(),
    }
}

fn finite_number(n: f64) -> Option<Value> {
    serde_json::Number::from_f64(n).map(Value::Number)
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Interpret a boolean in either system's representation.
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" => Some(true),
            "0" | "false" | "f" | "no" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Interpret a timestamp given as epoch millis, RFC 3339, or a SQL datetime
/// literal (assumed UTC).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        Value::String(s) => parse_timestamp_str(s.trim()),
        _ => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Postgres renders timestamptz as "2024-01-01 10:00:00+00"
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%#z", "%Y-%m-%dT%H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis)
}

fn format_timestamp(ts: DateTime<Utc>, target: System) -> String {
    match target {
        System::A => ts.format("%Y-%m-%d %H:%M:%S%.f").to_string(),
        System::B => ts.to_rfc3339_opts(SecondsFormat::AutoSi, true),
    }
}
