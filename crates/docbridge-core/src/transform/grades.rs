use docbridge_source::{Embedded, Fields, SourceDocument};
use docbridge_target::TargetRow;

use super::{
    child_key, mean, required_date, required_id, with_timestamps, AnomalyKind, ChildKeys,
    EntityTransformer, Registration, TransformError, TransformOptions, Transformed,
};
use crate::family::{EntityKind, Family};
use crate::translator::IdentifierTranslator;

const STATS_TOLERANCE: f64 = 0.001;

/// `gradenews` → `grades` + `grades_records`.
///
/// The `stats_*` columns are always recomputed from the records; embedded
/// stats that disagree are reported as stale.
#[derive(Debug, Clone)]
pub struct GradeTransformer {
    options: TransformOptions,
}

impl GradeTransformer {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }
}

/// Aggregates over the records of one grade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GradeStats {
    pub average: f64,
    pub highest: Option<f64>,
    pub lowest: Option<f64>,
    pub absent: usize,
    pub total: usize,
}

impl GradeStats {
    /// `(value, is_absent)` per record. Absent students and records without
    /// a value do not contribute to the average.
    pub fn compute(records: &[(Option<f64>, bool)]) -> Self {
        let values: Vec<f64> = records
            .iter()
            .filter(|(_, absent)| !absent)
            .filter_map(|(value, _)| *value)
            .collect();
        Self {
            average: mean(&values),
            highest: values.iter().copied().reduce(f64::max),
            lowest: values.iter().copied().reduce(f64::min),
            absent: records.iter().filter(|(_, absent)| *absent).count(),
            total: records.len(),
        }
    }
}

impl EntityTransformer for GradeTransformer {
    fn family(&self) -> Family {
        Family::Grades
    }

    fn transform(
        &self,
        doc: &SourceDocument,
        translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError> {
        let id = doc.id();
        let now = self.options.now;
        let session = required_id(doc, id, "sessionId")?;
        let date = required_date(doc, id, "date")?;

        let key = id.to_string();
        let mut keys = ChildKeys::default();
        let mut records = Vec::new();
        let mut skipped = 0;
        for value in doc.array_field("records") {
            let Some(record) = Embedded::from_value(value) else {
                skipped += 1;
                continue;
            };
            let Some(student) = record.object_id_field("student") else {
                tracing::warn!(source_id = %id, field = "records.student", "grade record without student skipped");
                skipped += 1;
                continue;
            };
            let record_key = child_key(&key, "record", student);
            if !keys.claim(&record_key) {
                skipped += 1;
                continue;
            }
            records.push((record_key, student, record));
        }

        let stats = GradeStats::compute(
            &records
                .iter()
                .map(|(_, _, r)| (r.f64_field("value"), r.bool_field("isAbsent").unwrap_or(false)))
                .collect::<Vec<_>>(),
        );

        let row = TargetRow::new("grades", key)
            .reference(
                "course_session_id",
                session,
                translator.resolve_kind(session, EntityKind::Session),
            )
            .data("mongo_session_id", session.to_string())
            .data("date", date)
            .data("type", doc.str_field("type"))
            .data("is_draft", doc.bool_field("isDraft").unwrap_or(false))
            .data("stats_average_grade", stats.average)
            .data("stats_highest_grade", stats.highest)
            .data("stats_lowest_grade", stats.lowest)
            .data("stats_absent_count", stats.absent)
            .data("stats_total_students", stats.total);
        let mut out = Transformed::new(with_timestamps(row, doc, now));
        out.skipped_children = skipped;

        if let Some(embedded) = doc.embedded("stats") {
            let mut stale = Vec::new();
            if let Some(avg) = embedded.f64_field("averageGrade") {
                if (avg - stats.average).abs() > STATS_TOLERANCE {
                    stale.push(format!("averageGrade {avg} != {}", stats.average));
                }
            }
            for (field, computed) in [("absentCount", stats.absent), ("totalStudents", stats.total)] {
                if let Some(stored) = embedded.i64_field(field) {
                    if usize::try_from(stored).ok() != Some(computed) {
                        stale.push(format!("{field} {stored} != {computed}"));
                    }
                }
            }
            if !stale.is_empty() {
                out.anomaly(id, "stats", AnomalyKind::StaleAggregate, stale.join(", "));
            }
        }

        for (record_key, student, record) in records {
            let row = TargetRow::new("grades_records", record_key)
                .parent("grade_id", &out.primary)
                .data("mongo_student_id", student.to_string())
                .reference(
                    "student_id",
                    student,
                    translator.resolve_kind(student, EntityKind::User),
                )
                .data("value", record.f64_field("value"))
                .data("is_absent", record.bool_field("isAbsent").unwrap_or(false))
                .data("comment", record.str_field("comment"));
            out.children.push(with_timestamps(row, &record, now));
        }

        let display_name = match doc.str_field("type") {
            Some(kind) => format!("{kind} {date}"),
            None => format!("grade {date}"),
        };
        out.registrations.push(Registration::for_row(
            id,
            EntityKind::Grade,
            &out.primary,
            display_name,
        ));
        Ok(out)
    }
}
