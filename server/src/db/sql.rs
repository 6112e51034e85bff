//! SQL text helpers shared by the MySQL and PostgreSQL stores.

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use rowsync_engine::Guard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dialect {
    Postgres,
    MySql,
}

impl Dialect {
    /// Quote an identifier, treating `.` as a schema separator.
    pub(crate) fn quote(self, ident: &str) -> String {
        let (open, close) = match self {
            Dialect::Postgres => ('"', '"'),
            Dialect::MySql => ('`', '`'),
        };
        ident
            .split('.')
            .map(|part| {
                let escaped = part.replace(close, &format!("{close}{close}"));
                format!("{open}{escaped}{close}")
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Quoted column, optionally qualified by a table alias.
    pub(crate) fn column(self, alias: Option<&str>, column: &str) -> String {
        match alias {
            Some(alias) => format!("{alias}.{}", self.quote(column)),
            None => self.quote(column),
        }
    }

    pub(crate) fn quote_all<'a>(self, columns: impl IntoIterator<Item = &'a str>) -> String {
        columns
            .into_iter()
            .map(|c| self.quote(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// The compare-and-set condition for `guard`, reading the current row via
    /// `alias` and comparing against `placeholder`.
    pub(crate) fn guard_condition(
        self,
        guard: &Guard,
        alias: Option<&str>,
        placeholder: &str,
    ) -> String {
        let column = self.column(alias, guard.column());
        match guard {
            Guard::TimestampBefore { .. } => {
                format!("({column} IS NULL OR {column} < {placeholder})")
            }
            Guard::VersionBelow { .. } => format!("COALESCE({column}, 0) < {placeholder}"),
        }
    }
}

/// The value a guard compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GuardValue {
    At(DateTime<Utc>),
    Version(i64),
}

impl GuardValue {
    pub(crate) fn of(guard: &Guard) -> Result<Self> {
        match guard {
            Guard::TimestampBefore { column, millis } => DateTime::from_timestamp_millis(*millis)
                .map(GuardValue::At)
                .ok_or_else(|| {
                    SyncError::Engine(rowsync_engine::Error::InvalidTimestamp {
                        column: column.clone(),
                        value: millis.to_string(),
                    })
                }),
            Guard::VersionBelow { version, .. } => Ok(GuardValue::Version(*version)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting() {
        assert_eq!(Dialect::Postgres.quote("users"), "\"users\"");
        assert_eq!(Dialect::Postgres.quote("public.users"), "\"public\".\"users\"");
        assert_eq!(Dialect::Postgres.quote("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(Dialect::MySql.quote("order"), "`order`");
        assert_eq!(Dialect::MySql.quote("a`b"), "`a``b`");
        assert_eq!(Dialect::MySql.quote_all(["id", "name"]), "`id`, `name`");
    }

    #[test]
    fn guard_conditions() {
        let ts = Guard::TimestampBefore {
            column: "updated_at".into(),
            millis: 0,
        };
        assert_eq!(
            Dialect::Postgres.guard_condition(&ts, Some("t"), "$2"),
            "(t.\"updated_at\" IS NULL OR t.\"updated_at\" < $2)"
        );

        let version = Guard::VersionBelow {
            column: "version".into(),
            version: 3,
        };
        assert_eq!(
            Dialect::MySql.guard_condition(&version, None, "?"),
            "COALESCE(`version`, 0) < ?"
        );
    }

    #[test]
    fn guard_values() {
        let ts = Guard::TimestampBefore {
            column: "updated_at".into(),
            millis: 1_704_067_200_000,
        };
        match GuardValue::of(&ts).unwrap() {
            GuardValue::At(at) => assert_eq!(at.to_rfc3339(), "2024-01-01T00:00:00+00:00"),
            other => panic!("unexpected {other:?}"),
        }

        let out_of_range = Guard::TimestampBefore {
            column: "updated_at".into(),
            millis: i64::MAX,
        };
        assert!(GuardValue::of(&out_of_range).is_err());
    }
}
