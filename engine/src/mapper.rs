//! Row mapping: source-shaped payload in, target-shaped row out.
//!
//! 1. Pick the payload (`after`, or `before` for deletes)
//! 2. For each column mapping present in the payload, coerce the value into
//!    the target's representation, then apply the column transform
//! 3. Run table transforms in order over the mapped row
//! 4. Extract the primary key
//!
//! Columns missing from the payload are omitted, never defaulted.

use crate::{
    error::Result, mapping::PrimaryKey, transform::LookupTables, ChangeEvent, Direction, Error,
    Row, TableMapping,
};

/// A mapped row together with its primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub values: Row,
    pub key: PrimaryKey,
}

/// Map the event's payload through `mapping`.
pub fn map_event(
    event: &ChangeEvent,
    mapping: &TableMapping,
    direction: Direction,
    lookups: &LookupTables,
) -> Result<MappedRow> {
    let values = map_row(event.payload()?, mapping, direction, lookups)?;
    let key = mapping.key_of(&values)?;
    Ok(MappedRow { values, key })
}

/// Map a single source row. Does not require the primary key to be present.
pub fn map_row(
    source: &Row,
    mapping: &TableMapping,
    direction: Direction,
    lookups: &LookupTables,
) -> Result<Row> {
    let target = direction.target();
    let mut out = Row::new();

    for column in &mapping.source.columns {
        if mapping.skip_columns.contains(&column.source) {
            continue;
        }
        let Some(value) = source.get(&column.source) else {
            continue;
        };
        if value.is_null() && !column.nullable {
            return Err(Error::NullInNonNullable {
                column: column.target.clone(),
            });
        }

        let mut mapped = column.semantic_type.coerce(value, target, &column.target)?;
        if let Some(transform) = column.transform {
            mapped = transform.apply(&mapped, &column.target)?;
        }
        out.insert(column.target.clone(), mapped);
    }

    for transform in &mapping.transformations {
        let value = transform.apply(&out, lookups)?;
        out.insert(transform.column().to_string(), value);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ColumnMapping, ColumnTransform, Operation, SemanticType, System, TableTransform,
    };
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn users() -> TableMapping {
        TableMapping::new(System::A, "users", "users")
            .column("id", "id", SemanticType::Integer)
            .column("first", "first_name", SemanticType::Text)
            .column("last", "last_name", SemanticType::Text)
            .column("is_active", "active", SemanticType::Boolean)
            .column("modified_date", "updated_at", SemanticType::Timestamp)
            .column("prefs", "preferences", SemanticType::Json)
            .with_column(
                ColumnMapping::new("code", "code", SemanticType::Text)
                    .with_transform(ColumnTransform::Uppercase),
            )
            .column("internal_notes", "notes", SemanticType::Text)
            .skip("internal_notes")
            .with_transformation(TableTransform::Concat {
                column: "full_name".into(),
                fields: vec!["first_name".into(), "last_name".into()],
                separator: " ".into(),
            })
    }

    #[test]
    fn maps_and_coerces_forward() {
        let event = ChangeEvent::new(Operation::Create, "mysql", "users", 1).with_after(row(json!({
            "id": 1,
            "first": "Ada",
            "last": "Lovelace",
            "is_active": 1,
            "modified_date": "2024-01-01 00:00:00",
            "prefs": "{\"theme\":\"dark\"}",
            "code": "abc",
            "internal_notes": "secret",
            "unmapped": "ignored"
        })));

        let mapped = map_event(&event, &users(), Direction::AToB, &LookupTables::new()).unwrap();

        assert_eq!(
            Value::Object(mapped.values),
            json!({
                "id": 1,
                "first_name": "Ada",
                "last_name": "Lovelace",
                "active": true,
                "updated_at": "2024-01-01T00:00:00Z",
                "preferences": {"theme": "dark"},
                "code": "ABC",
                "full_name": "Ada Lovelace"
            })
        );
        assert_eq!(mapped.key.key_string(), "1");
    }

    #[test]
    fn absent_columns_are_omitted() {
        let mapping = TableMapping::new(System::A, "users", "users")
            .column("id", "id", SemanticType::Integer)
            .column("name", "name", SemanticType::Text);
        let source = row(json!({"id": 2, "name": null}));
        let out = map_row(&source, &mapping, Direction::AToB, &LookupTables::new()).unwrap();
        assert_eq!(Value::Object(out), json!({"id": 2, "name": null}));

        let source = row(json!({"id": 2}));
        let out = map_row(&source, &mapping, Direction::AToB, &LookupTables::new()).unwrap();
        assert_eq!(Value::Object(out), json!({"id": 2}));
    }

    #[test]
    fn deletes_map_the_before_image() {
        let event = ChangeEvent::new(Operation::Delete, "mysql", "users", 1)
            .with_before(row(json!({"id": 9, "first": "x", "last": "y"})));
        let mapped = map_event(&event, &users(), Direction::AToB, &LookupTables::new()).unwrap();
        assert_eq!(mapped.key.key_string(), "9");
    }

    #[test]
    fn mapping_errors_are_scoped_to_the_event() {
        let bad_json = ChangeEvent::new(Operation::Update, "mysql", "users", 1).with_after(row(json!({
            "id": 1, "first": "a", "last": "b", "prefs": "{not json"
        })));
        let err = map_event(&bad_json, &users(), Direction::AToB, &LookupTables::new()).unwrap_err();
        assert!(err.is_mapping_error());
        assert!(matches!(err, Error::InvalidJson { column, .. } if column == "preferences"));

        let no_key = ChangeEvent::new(Operation::Update, "mysql", "users", 1)
            .with_after(row(json!({"first": "a", "last": "b"})));
        let err = map_event(&no_key, &users(), Direction::AToB, &LookupTables::new()).unwrap_err();
        assert!(matches!(err, Error::MissingPrimaryKey { .. }));

        let strict = TableMapping::new(System::A, "users", "users")
            .with_column(ColumnMapping::new("id", "id", SemanticType::Integer).not_null());
        let null_id = row(json!({"id": null}));
        assert!(matches!(
            map_row(&null_id, &strict, Direction::AToB, &LookupTables::new()),
            Err(Error::NullInNonNullable { .. })
        ));
    }

    #[test]
    fn lookup_transform_uses_static_tables() {
        let mapping = TableMapping::new(System::A, "users", "users")
            .column("id", "id", SemanticType::Integer)
            .column("user_type", "user_type", SemanticType::Integer)
            .with_transformation(TableTransform::Lookup {
                column: "role".into(),
                source_field: "user_type".into(),
                table: "user_types".into(),
                default: None,
            });
        let mut lookups = LookupTables::new();
        lookups.insert("user_types", BTreeMap::from([("2".to_string(), json!("editor"))]));

        let out = map_row(
            &row(json!({"id": 1, "user_type": 2})),
            &mapping,
            Direction::AToB,
            &lookups,
        )
        .unwrap();
        assert_eq!(out["role"], json!("editor"));
    }

    #[test]
    fn reverse_mapping_restores_source_values() {
        let forward = TableMapping::new(System::A, "accounts", "accounts")
            .column("id", "id", SemanticType::Integer)
            .column("is_active", "active", SemanticType::Boolean)
            .column("modified", "updated_at", SemanticType::Timestamp)
            .column("settings", "settings", SemanticType::Json)
            .with_column(
                ColumnMapping::new("region", "region", SemanticType::Text)
                    .with_transform(ColumnTransform::Lowercase),
            );
        let reverse = forward.reverse().unwrap();

        let original = row(json!({
            "id": 3,
            "is_active": 0,
            "modified": "2024-02-29 12:30:45.125",
            "settings": "{\"a\":[1,2]}",
            "region": "EU"
        }));
        let there = map_row(&original, &forward, Direction::AToB, &LookupTables::new()).unwrap();
        let back = map_row(&there, &reverse, Direction::BToA, &LookupTables::new()).unwrap();

        assert_eq!(back, original);
    }
}
