use docbridge_source::{Embedded, Fields, SourceDocument};
use docbridge_target::TargetRow;

use super::{
    child_key, rate, required_date, required_id, with_timestamps, ChildKeys, EntityTransformer,
    Registration, TransformError, TransformOptions, Transformed,
};
use crate::family::{EntityKind, Family};
use crate::translator::IdentifierTranslator;

/// `attendancenews` → `attendances` + `attendance_records`.
///
/// The document's `course` field holds the session id. `presence_rate` is
/// computed from the records that produced a row.
#[derive(Debug, Clone)]
pub struct AttendanceTransformer {
    options: TransformOptions,
}

impl AttendanceTransformer {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }
}

impl EntityTransformer for AttendanceTransformer {
    fn family(&self) -> Family {
        Family::Attendances
    }

    fn transform(
        &self,
        doc: &SourceDocument,
        translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError> {
        let id = doc.id();
        let now = self.options.now;
        let session = required_id(doc, id, "course")?;
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
                tracing::warn!(source_id = %id, field = "records.student", "attendance record without student skipped");
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

        let present = records
            .iter()
            .filter(|(_, _, r)| r.bool_field("isPresent").unwrap_or(false))
            .count();

        let row = TargetRow::new("attendances", key)
            .reference(
                "course_session_id",
                session,
                translator.resolve_kind(session, EntityKind::Session),
            )
            .data("mongo_session_id", session.to_string())
            .data("date", date)
            .data("presence_rate", rate(present, records.len()))
            .data("total_students", records.len())
            .data("is_active", doc.bool_field("isActive").unwrap_or(true));
        let mut out = Transformed::new(with_timestamps(row, doc, now));
        out.skipped_children = skipped;

        for (record_key, student, record) in records {
            let row = TargetRow::new("attendance_records", record_key)
                .parent("attendance_id", &out.primary)
                .data("mongo_student_id", student.to_string())
                .reference(
                    "student_id",
                    student,
                    translator.resolve_kind(student, EntityKind::User),
                )
                .data("is_present", record.bool_field("isPresent").unwrap_or(false))
                .data("comment", record.str_field("comment"));
            out.children.push(with_timestamps(row, &record, now));
        }

        out.registrations.push(Registration::for_row(
            id,
            EntityKind::Attendance,
            &out.primary,
            format!("attendance {date}"),
        ));
        Ok(out)
    }
}
