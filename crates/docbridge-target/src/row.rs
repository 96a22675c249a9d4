//! Rows read from and written to the target store.

use docbridge_source::ObjectId;
use uuid::Uuid;

use crate::SqlValue;

/// A row as returned by a query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    pub columns: Vec<String>,
    pub values: Vec<SqlValue>,
}

impl SqlRow {
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(SqlValue::as_text)
    }

    pub fn uuid(&self, column: &str) -> Option<Uuid> {
        self.get(column).and_then(SqlValue::as_uuid)
    }

    pub fn i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            SqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn f64(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }

    pub fn bool(&self, column: &str) -> Option<bool> {
        self.i64(column).map(|i| i != 0)
    }
}

/// How a column of a transformed row relates to the rest of the migration.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnRole {
    /// Value derived from the source document.
    Data,
    /// Value defaulted from the clock; differs between two transforms.
    Volatile,
    /// Link to the parent row produced from the same document.
    Parent { source_key: String },
    /// Foreign key to another entity, `Null` until its referent is mapped.
    Reference { source_id: ObjectId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: SqlValue,
    pub role: ColumnRole,
}

/// A row produced by a transformer, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRow {
    pub table: String,
    pub id: Uuid,
    pub source_key: String,
    pub columns: Vec<Column>,
}

impl TargetRow {
    /// New row with a fresh surrogate key.
    pub fn new(table: &str, source_key: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            id: Uuid::new_v4(),
            source_key: source_key.into(),
            columns: Vec::new(),
        }
    }

    pub fn data(self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.with(name, value.into(), ColumnRole::Data)
    }

    pub fn volatile(self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.with(name, value.into(), ColumnRole::Volatile)
    }

    /// Source value when present, otherwise `fallback` marked volatile.
    pub fn data_or_volatile(
        self,
        name: &str,
        value: Option<impl Into<SqlValue>>,
        fallback: impl Into<SqlValue>,
    ) -> Self {
        match value {
            Some(v) => self.data(name, v),
            None => self.volatile(name, fallback),
        }
    }

    pub fn parent(self, name: &str, parent: &TargetRow) -> Self {
        let role = ColumnRole::Parent {
            source_key: parent.source_key.clone(),
        };
        self.with(name, SqlValue::Uuid(parent.id), role)
    }

    /// Foreign key to `source_id`; `resolved` is `None` while unmapped.
    pub fn reference(self, name: &str, source_id: ObjectId, resolved: Option<Uuid>) -> Self {
        self.with(name, resolved.into(), ColumnRole::Reference { source_id })
    }

    pub fn with(mut self, name: &str, value: SqlValue, role: ColumnRole) -> Self {
        self.columns.push(Column {
            name: name.to_string(),
            value,
            role,
        });
        self
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&SqlValue> {
        self.column(name).map(|c| &c.value)
    }

    /// Reference columns whose value is still `Null`.
    pub fn unresolved_references(&self) -> impl Iterator<Item = (&str, ObjectId)> + '_ {
        self.columns.iter().filter_map(|c| match &c.role {
            ColumnRole::Reference { source_id } if c.value.is_null() => {
                Some((c.name.as_str(), *source_id))
            }
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unresolved_references() {
        let student = ObjectId::parse_str("6733728d9c906b85f3705d5e").unwrap();
        let session = ObjectId::parse_str("6733728d9c906b85f3705d5f").unwrap();
        let parent = TargetRow::new("attendances", "a");
        let row = TargetRow::new("attendance_records", "a/record/x")
            .parent("attendance_id", &parent)
            .reference("student_id", student, None)
            .reference("course_session_id", session, Some(Uuid::new_v4()))
            .data("is_present", true);

        let pending: Vec<_> = row.unresolved_references().collect();
        assert_eq!(pending, vec![("student_id", student)]);
        assert_eq!(row.value("is_present"), Some(&SqlValue::Bool(true)));
        assert_eq!(
            row.value("attendance_id").and_then(SqlValue::as_uuid),
            Some(parent.id)
        );
    }

    #[test]
    fn test_sql_row_accessors() {
        let id = Uuid::new_v4();
        let row = SqlRow::new(
            vec!["id".into(), "rate".into(), "active".into()],
            vec![SqlValue::Text(id.to_string()), SqlValue::Real(50.0), SqlValue::Int(1)],
        );
        assert_eq!(row.uuid("id"), Some(id));
        assert_eq!(row.f64("rate"), Some(50.0));
        assert_eq!(row.bool("active"), Some(true));
        assert_eq!(row.get("missing"), None);
    }
}
