//! Entity Transformers: one source document → primary row + child rows.
//!
//! ```text
//!   SourceDocument ──► EntityTransformer ──► Transformed
//!                          │   ▲                ├─ primary   (TargetRow)
//!              resolve ids │   │                ├─ children  (TargetRow*)
//!                          ▼   │                ├─ registrations
//!                  IdentifierTranslator         ├─ anomalies
//!                                               └─ pending() (NULL references)
//! ```
//!
//! Transformers never touch a store. A reference whose referent is not yet
//! mapped is written `NULL` and surfaces through [`Transformed::pending`].

mod attendances;
mod behaviors;
mod courses;
mod grades;
mod stats;
mod users;

pub use attendances::AttendanceTransformer;
pub use behaviors::{BehaviorTransformer, CourseIndex};
pub use courses::CourseTransformer;
pub use grades::GradeTransformer;
pub use stats::StatsTransformer;
pub use users::UserTransformer;

use chrono::{DateTime, Utc};
use docbridge_source::{Fields, ObjectId, SourceDocument, SourceError, SourceStore};
use docbridge_target::{ColumnRole, TargetRow};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::family::{EntityKind, Family};
use crate::translator::{Descriptor, IdentifierTranslator};

// ============================================================================
// Output types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    MissingField,
    Defaulted,
    InvalidValue,
    StaleAggregate,
    HeuristicMatch,
}

/// Something unusual about a document that did not prevent its migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Anomaly {
    pub source_id: ObjectId,
    pub field: String,
    pub kind: AnomalyKind,
    pub detail: String,
}

/// An entity created by a document, registered once its rows are committed.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub source_id: ObjectId,
    pub kind: EntityKind,
    pub table: String,
    pub source_key: String,
    pub target_key: Uuid,
    pub display_name: String,
}

impl Registration {
    pub fn for_row(source_id: ObjectId, kind: EntityKind, row: &TargetRow, display_name: String) -> Self {
        Self {
            source_id,
            kind,
            table: row.table.clone(),
            source_key: row.source_key.clone(),
            target_key: row.id,
            display_name,
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        Descriptor::new(self.kind, self.display_name.clone())
    }
}

/// A foreign key left `NULL` because its referent was not mapped yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct PendingReference {
    pub table: String,
    pub row_id: Uuid,
    pub column: String,
    pub source_id: ObjectId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transformed {
    pub primary: TargetRow,
    pub children: Vec<TargetRow>,
    pub registrations: Vec<Registration>,
    pub anomalies: Vec<Anomaly>,
    /// Malformed or repeated embedded entries that produced no row.
    pub skipped_children: usize,
}

impl Transformed {
    pub fn new(primary: TargetRow) -> Self {
        Self {
            primary,
            children: Vec::new(),
            registrations: Vec::new(),
            anomalies: Vec::new(),
            skipped_children: 0,
        }
    }

    /// Primary row first, then children in insertion order (parents before
    /// their own children).
    pub fn rows(&self) -> impl Iterator<Item = &TargetRow> {
        std::iter::once(&self.primary).chain(self.children.iter())
    }

    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut TargetRow> {
        std::iter::once(&mut self.primary).chain(self.children.iter_mut())
    }

    pub fn pending(&self) -> Vec<PendingReference> {
        self.rows()
            .flat_map(|row| {
                row.unresolved_references()
                    .map(move |(column, source_id)| PendingReference {
                        table: row.table.clone(),
                        row_id: row.id,
                        column: column.to_string(),
                        source_id,
                    })
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        1 + self.children.len()
    }

    fn anomaly(&mut self, source_id: ObjectId, field: &str, kind: AnomalyKind, detail: String) {
        self.anomalies.push(Anomaly {
            source_id,
            field: field.to_string(),
            kind,
            detail,
        });
    }

    /// Remove reference columns pointing at entities of this family's level
    /// or later. Returns how many were dropped.
    pub fn drop_forward_references(&mut self, family: Family) -> usize {
        let mut dropped = 0;
        for row in self.rows_mut() {
            let table = row.table.clone();
            row.columns.retain(|c| {
                if !matches!(c.role, ColumnRole::Reference { .. }) {
                    return true;
                }
                let allowed = family
                    .deferred_column(&table, &c.name)
                    .map_or(false, |d| family.may_reference(d.kind));
                if !allowed {
                    tracing::warn!(family = %family, table = %table, column = %c.name, "dropping forward reference");
                    dropped += 1;
                }
                allowed
            });
        }
        dropped
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("document {source_id}: missing required field `{field}`")]
    MissingRequired {
        source_id: ObjectId,
        field: &'static str,
    },
    #[error("document {source_id}: invalid `{field}`: {reason}")]
    Invalid {
        source_id: ObjectId,
        field: &'static str,
        reason: String,
    },
}

// ============================================================================
// Transformer trait and options
// ============================================================================

/// Injected clock and heuristics.
#[derive(Debug, Clone, Copy)]
pub struct TransformOptions {
    pub now: DateTime<Utc>,
    /// Match behaviors to the course created nearest to them when no
    /// explicit course or session is found.
    pub nearest_date_fallback: bool,
}

impl Default for TransformOptions {
    fn default() -> Self {
        Self {
            now: Utc::now(),
            nearest_date_fallback: true,
        }
    }
}

pub trait EntityTransformer {
    fn family(&self) -> Family;

    fn transform(
        &self,
        doc: &SourceDocument,
        translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError>;
}

/// Transformer for `family`. Behaviors need an index of the source courses,
/// which is built here.
pub fn for_family<S: SourceStore + ?Sized>(
    family: Family,
    source: &S,
    options: TransformOptions,
) -> Result<Box<dyn EntityTransformer>, SourceError> {
    Ok(match family {
        Family::Users => Box::new(UserTransformer::new(options)),
        Family::Courses => Box::new(CourseTransformer::new(options)),
        Family::Attendances => Box::new(AttendanceTransformer::new(options)),
        Family::Grades => Box::new(GradeTransformer::new(options)),
        Family::Behaviors => {
            let index = CourseIndex::from_source(source)?;
            Box::new(BehaviorTransformer::new(options, index))
        }
        Family::Statistics => Box::new(StatsTransformer::new(options)),
    })
}

// ============================================================================
// Shared helpers
// ============================================================================

fn digits() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d+").ok()).as_ref()
}

/// Levels arrive as `3`, `"3"` or a range such as `"3-4"`; the first
/// integer wins.
pub fn normalize_level(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<i64>() {
        return Some(n);
    }
    digits()?.find(raw)?.as_str().parse().ok()
}

/// Percentage of `hits` over `total`; `0` when there is nothing to count.
pub fn rate(hits: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64 * 100.0
    }
}

/// Arithmetic mean; `0` for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Claims child source keys so repeated embedded entries are skipped.
#[derive(Debug, Default)]
struct ChildKeys(HashSet<String>);

impl ChildKeys {
    fn claim(&mut self, key: &str) -> bool {
        self.0.insert(key.to_string())
    }
}

fn child_key(parent: &str, relation: &str, discriminator: impl std::fmt::Display) -> String {
    format!("{parent}/{relation}/{discriminator}")
}

/// Standard `created_at` / `updated_at` columns from the document's own
/// fields, or the clock.
fn with_timestamps<F: Fields + ?Sized>(row: TargetRow, fields: &F, now: DateTime<Utc>) -> TargetRow {
    row.data_or_volatile("created_at", fields.datetime_field("createdAt"), now)
        .data_or_volatile("updated_at", fields.datetime_field("updatedAt"), now)
}

fn required_id<F: Fields + ?Sized>(
    fields: &F,
    source_id: ObjectId,
    field: &'static str,
) -> Result<ObjectId, TransformError> {
    match fields.get(field) {
        None => Err(TransformError::MissingRequired { source_id, field }),
        Some(value) => docbridge_source::document::decode_object_id(value).ok_or_else(|| {
            TransformError::Invalid {
                source_id,
                field,
                reason: format!("not an object id: {value}"),
            }
        }),
    }
}

fn required_date<F: Fields + ?Sized>(
    fields: &F,
    source_id: ObjectId,
    field: &'static str,
) -> Result<chrono::NaiveDate, TransformError> {
    match fields.get(field) {
        None => Err(TransformError::MissingRequired { source_id, field }),
        Some(value) => fields
            .datetime_field(field)
            .map(|t| t.date_naive())
            .ok_or_else(|| TransformError::Invalid {
                source_id,
                field,
                reason: format!("not a date: {value}"),
            }),
    }
}
