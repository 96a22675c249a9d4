//! Source documents and typed field access.
//!
//! Documents arrive as JSON in the extended form written by `mongoexport`
//! (`{"$oid": ..}`, `{"$date": ..}`, `{"$numberLong": ..}`, ...). Plain JSON
//! scalars are accepted everywhere the extended form is.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::{ObjectId, SourceError};

/// One record of a source collection. Immutable once loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    id: ObjectId,
    body: Map<String, Value>,
}

impl SourceDocument {
    /// Wrap a decoded JSON object. The `_id` must be a valid [`ObjectId`].
    pub fn from_value(value: Value) -> Result<Self, SourceError> {
        let Value::Object(body) = value else {
            return Err(SourceError::InvalidDocument(
                "document is not a JSON object".to_string(),
            ));
        };
        let id = body
            .get("_id")
            .and_then(decode_object_id)
            .ok_or_else(|| SourceError::InvalidDocument("missing or invalid `_id`".to_string()))?;
        Ok(Self { id, body })
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Creation time: the `createdAt` field when present, otherwise the
    /// timestamp embedded in the identifier.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.datetime_field("createdAt")
            .unwrap_or_else(|| self.id.timestamp())
    }
}

/// Borrowed view on an embedded sub-document.
#[derive(Debug, Clone, Copy)]
pub struct Embedded<'a>(&'a Map<String, Value>);

impl<'a> Embedded<'a> {
    pub fn from_value(value: &'a Value) -> Option<Self> {
        value.as_object().map(Embedded)
    }
}

/// Identifiers read from an array-valued reference field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceList {
    pub ids: Vec<ObjectId>,
    /// Entries that were null, empty or not an identifier.
    pub invalid: usize,
}

/// Typed accessors shared by documents and sub-documents.
///
/// `null` values are treated as absent.
pub trait Fields {
    fn fields(&self) -> &Map<String, Value>;

    fn get(&self, field: &str) -> Option<&Value> {
        self.fields().get(field).filter(|v| !v.is_null())
    }

    fn has(&self, field: &str) -> bool {
        self.get(field).is_some()
    }

    fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    /// String, or a number rendered as text (classroom numbers, levels).
    fn text_field(&self, field: &str) -> Option<String> {
        match self.get(field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            other => decode_i64(other).map(|n| n.to_string()),
        }
    }

    fn bool_field(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    fn i64_field(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(decode_i64)
    }

    fn f64_field(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(decode_f64)
    }

    fn datetime_field(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get(field).and_then(decode_datetime)
    }

    fn object_id_field(&self, field: &str) -> Option<ObjectId> {
        self.get(field).and_then(decode_object_id)
    }

    /// Elements of an array field; empty when absent or not an array.
    fn array_field(&self, field: &str) -> &[Value] {
        self.get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn embedded(&self, field: &str) -> Option<Embedded<'_>> {
        self.get(field).and_then(Embedded::from_value)
    }

    fn object_ids(&self, field: &str) -> ReferenceList {
        let mut list = ReferenceList::default();
        for value in self.array_field(field) {
            match decode_object_id(value) {
                Some(id) => list.ids.push(id),
                None => list.invalid += 1,
            }
        }
        list
    }
}

impl Fields for SourceDocument {
    fn fields(&self) -> &Map<String, Value> {
        &self.body
    }
}

impl Fields for Embedded<'_> {
    fn fields(&self) -> &Map<String, Value> {
        self.0
    }
}

// ============================================================================
// Extended JSON decoding
// ============================================================================

fn extended<'v>(value: &'v Value, keys: &[&str]) -> Option<&'v Value> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    keys.iter().find_map(|k| obj.get(*k))
}

pub fn decode_object_id(value: &Value) -> Option<ObjectId> {
    match value {
        Value::String(s) => ObjectId::parse_str(s).ok(),
        other => extended(other, &["$oid"])
            .and_then(Value::as_str)
            .and_then(|s| ObjectId::parse_str(s).ok()),
    }
}

pub fn decode_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        other => {
            let inner = extended(other, &["$numberInt", "$numberLong", "$numberDouble"])?;
            decode_i64(inner)
        }
    }
}

pub fn decode_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        other => {
            let inner = extended(
                other,
                &["$numberDouble", "$numberDecimal", "$numberInt", "$numberLong"],
            )?;
            decode_f64(inner)
        }
    }
}

pub fn decode_datetime(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_datetime_str(s),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        other => {
            let inner = extended(other, &["$date"])?;
            match inner {
                Value::Object(_) => extended(inner, &["$numberLong"])
                    .and_then(decode_i64)
                    .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
                scalar => decode_datetime(scalar),
            }
        }
    }
}

fn parse_datetime_str(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Short type name of a value, extended-JSON aware.
pub fn value_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "double",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(obj) if obj.len() == 1 => match obj.keys().next().map(String::as_str) {
            Some("$oid") => "objectId",
            Some("$date") => "date",
            Some("$numberInt") | Some("$numberLong") => "int",
            Some("$numberDouble") => "double",
            Some("$numberDecimal") => "decimal",
            _ => "document",
        },
        Value::Object(_) => "document",
    }
}
