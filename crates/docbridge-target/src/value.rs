//! Column values exchanged with the target store.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A single column value.
///
/// Rich variants (`Bool`, `Uuid`, `Timestamp`, `Date`) are stored as
/// integers or canonical text; [`SqlValue::normalized`] yields that storage
/// form so a written value and its read-back compare equal.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Uuid(Uuid),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn normalized(&self) -> SqlValue {
        match self {
            SqlValue::Bool(b) => SqlValue::Int(i64::from(*b)),
            SqlValue::Uuid(u) => SqlValue::Text(u.to_string()),
            SqlValue::Timestamp(t) => SqlValue::Text(format_timestamp(t)),
            SqlValue::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
            other => other.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Int(i) => Some(*i as f64),
            SqlValue::Real(r) => Some(*r),
            SqlValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            SqlValue::Uuid(u) => Some(*u),
            SqlValue::Text(s) => Uuid::parse_str(s).ok(),
            _ => None,
        }
    }

    /// Equality on the storage form, with an absolute tolerance for numbers.
    pub fn approx_eq(&self, other: &SqlValue, tolerance: f64) -> bool {
        let (a, b) = (self.normalized(), other.normalized());
        match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() <= tolerance,
            _ => a == b,
        }
    }
}

/// Millisecond precision, `Z` suffix.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.normalized() {
            SqlValue::Null => write!(f, "NULL"),
            SqlValue::Int(i) => write!(f, "{i}"),
            SqlValue::Real(r) => write!(f, "{r}"),
            SqlValue::Text(s) => write!(f, "{s}"),
            // normalized() leaves no other variant
            other => write!(f, "{other:?}"),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self.normalized() {
            SqlValue::Null => Value::Null,
            SqlValue::Int(i) => Value::Integer(i),
            SqlValue::Real(r) => Value::Real(r),
            SqlValue::Text(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        };
        Ok(ToSqlOutput::Owned(value))
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => SqlValue::Null,
            ValueRef::Integer(i) => SqlValue::Int(i),
            ValueRef::Real(r) => SqlValue::Real(r),
            ValueRef::Text(t) | ValueRef::Blob(t) => {
                SqlValue::Text(String::from_utf8_lossy(t).into_owned())
            }
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<usize> for SqlValue {
    fn from(v: usize) -> Self {
        SqlValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_normalized_storage_forms() {
        let t = Utc.with_ymd_and_hms(2024, 1, 10, 8, 30, 0).unwrap();
        assert_eq!(
            SqlValue::Timestamp(t).normalized(),
            SqlValue::Text("2024-01-10T08:30:00.000Z".into())
        );
        assert_eq!(SqlValue::Bool(true).normalized(), SqlValue::Int(1));
        let d = NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        assert_eq!(SqlValue::Date(d).to_string(), "2024-01-10");
    }

    #[test]
    fn test_approx_eq_tolerance() {
        assert!(SqlValue::Real(14.2501).approx_eq(&SqlValue::Real(14.25), 0.001));
        assert!(!SqlValue::Real(14.26).approx_eq(&SqlValue::Real(14.25), 0.001));
        assert!(SqlValue::Int(3).approx_eq(&SqlValue::Real(3.0), 0.001));
        assert!(SqlValue::Bool(false).approx_eq(&SqlValue::Int(0), 0.0));
        assert!(!SqlValue::Text("a".into()).approx_eq(&SqlValue::Null, 0.001));
        assert!(SqlValue::Null.approx_eq(&SqlValue::Null, 0.001));
    }

    #[test]
    fn test_uuid_read_back_from_text() {
        let id = Uuid::new_v4();
        let stored = SqlValue::Uuid(id).normalized();
        assert_eq!(stored.as_uuid(), Some(id));
        assert!(SqlValue::Uuid(id).approx_eq(&stored, 0.001));
    }
}
