use chrono::Datelike;
use docbridge_source::{Embedded, Fields, ObjectId, SourceDocument};
use docbridge_target::TargetRow;

use super::{
    child_key, normalize_level, AnomalyKind, ChildKeys, EntityTransformer, Registration,
    TransformError, TransformOptions, Transformed,
};
use crate::family::{EntityKind, Family};
use crate::translator::IdentifierTranslator;

/// `coursenews` → `courses` with its teachers, sessions, timeslots and
/// session students.
///
/// Sessions are entities in their own right: they are registered so that
/// attendances, grades and behaviors can reference them.
#[derive(Debug, Clone)]
pub struct CourseTransformer {
    options: TransformOptions,
}

impl CourseTransformer {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }

    fn academic_year(&self, doc: &SourceDocument, out: &mut Transformed) -> Option<i64> {
        if let Some(year) = doc.i64_field("academicYear") {
            return Some(year);
        }
        let id = doc.id();
        match doc.text_field("academicYear") {
            None => {
                out.anomaly(
                    id,
                    "academicYear",
                    AnomalyKind::MissingField,
                    format!(
                        "missing academic year, defaulted to {}",
                        self.options.now.year()
                    ),
                );
                None
            }
            Some(raw) => {
                let parsed = normalize_level(&raw);
                out.anomaly(
                    id,
                    "academicYear",
                    AnomalyKind::InvalidValue,
                    match parsed {
                        Some(year) => format!("`{raw}` read as {year}"),
                        None => format!("`{raw}` unreadable, defaulted to {}", self.options.now.year()),
                    },
                );
                parsed
            }
        }
    }

    fn session(
        &self,
        doc: &SourceDocument,
        course: &TargetRow,
        session: Embedded<'_>,
        translator: &IdentifierTranslator,
        keys: &mut ChildKeys,
        out: &mut Transformed,
    ) {
        let course_id = doc.id();
        let Some(session_id) = session.object_id_field("_id") else {
            tracing::warn!(source_id = %course_id, field = "sessions._id", "session without id skipped");
            out.skipped_children += 1;
            return;
        };
        let session_key = session_id.to_string();
        if !keys.claim(&session_key) {
            out.skipped_children += 1;
            return;
        }

        let level = session.text_field("level");
        let normalized = level.as_deref().and_then(normalize_level);
        if let (Some(raw), None) = (&level, normalized) {
            out.anomaly(
                course_id,
                "sessions.level",
                AnomalyKind::InvalidValue,
                format!("session {session_id}: unreadable level `{raw}`"),
            );
        }

        let stats = session.embedded("stats");
        let subject = session.str_field("subject");
        let row = TargetRow::new("courses_sessions", session_key.clone())
            .parent("course_id", course)
            .data("subject", subject)
            .data("level", normalized)
            .data(
                "stats_average_attendance",
                stats.and_then(|s| s.f64_field("averageAttendance")),
            )
            .data(
                "stats_average_grade",
                stats.and_then(|s| s.f64_field("averageGrade")),
            )
            .data(
                "stats_average_behavior",
                stats.and_then(|s| s.f64_field("averageBehavior")),
            )
            .data(
                "stats_last_updated",
                stats.and_then(|s| s.datetime_field("lastUpdated")),
            );
        let row = inherit_timestamps(row, course);

        let display_name = match (subject, normalized) {
            (Some(subject), Some(level)) => format!("{subject} {level}"),
            (Some(subject), None) => subject.to_string(),
            (None, _) => format!("session {}", session_id.short(6)),
        };
        out.registrations.push(Registration::for_row(
            session_id,
            EntityKind::Session,
            &row,
            display_name,
        ));

        out.children.push(row.clone());
        if let Some(slot) = session.embedded("timeSlot") {
            let slot_row = TargetRow::new(
                "courses_sessions_timeslot",
                format!("{session_key}/timeslot"),
            )
            .parent("course_sessions_id", &row)
            .data("day_of_week", slot.text_field("dayOfWeek"))
            .data("start_time", slot.text_field("startTime"))
            .data("end_time", slot.text_field("endTime"))
            .data("classroom_number", slot.text_field("classroomNumber"));
            out.children.push(inherit_timestamps(slot_row, course));
        }

        let students = session.object_ids("students");
        if students.invalid > 0 {
            tracing::warn!(source_id = %course_id, session = %session_id, count = students.invalid, "empty student ids skipped");
            out.skipped_children += students.invalid;
        }
        for student in students.ids {
            let key = child_key(&session_key, "student", student);
            if !keys.claim(&key) {
                out.skipped_children += 1;
                continue;
            }
            let student_row = TargetRow::new("courses_sessions_students", key)
                .parent("course_sessions_id", &row)
                .data("mongo_student_id", student.to_string())
                .reference(
                    "student_id",
                    student,
                    translator.resolve_kind(student, EntityKind::User),
                );
            out.children.push(inherit_timestamps(student_row, course));
        }
    }
}

/// Child rows carry their course's timestamps.
fn inherit_timestamps(mut row: TargetRow, course: &TargetRow) -> TargetRow {
    for name in ["created_at", "updated_at"] {
        if let Some(column) = course.column(name) {
            row.columns.push(column.clone());
        }
    }
    row
}

fn teacher_rows(
    course_id: ObjectId,
    course: &TargetRow,
    doc: &SourceDocument,
    translator: &IdentifierTranslator,
    keys: &mut ChildKeys,
    out: &mut Transformed,
) {
    let teachers = doc.object_ids("teacher");
    if teachers.invalid > 0 {
        tracing::warn!(source_id = %course_id, count = teachers.invalid, "empty teacher ids skipped");
        out.skipped_children += teachers.invalid;
    }
    for teacher in teachers.ids {
        let key = child_key(&course.source_key, "teacher", teacher);
        if !keys.claim(&key) {
            out.skipped_children += 1;
            continue;
        }
        let row = TargetRow::new("courses_teacher", key)
            .parent("course_id", course)
            .data("mongo_teacher_id", teacher.to_string())
            .reference(
                "teacher_id",
                teacher,
                translator.resolve_kind(teacher, EntityKind::User),
            );
        out.children.push(inherit_timestamps(row, course));
    }
}

impl EntityTransformer for CourseTransformer {
    fn family(&self) -> Family {
        Family::Courses
    }

    fn transform(
        &self,
        doc: &SourceDocument,
        translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError> {
        let id = doc.id();
        let now = self.options.now;

        let mut out = Transformed::new(TargetRow::new("courses", id.to_string()));
        let year = self.academic_year(doc, &mut out);
        let course = out
            .primary
            .clone()
            .data_or_volatile("academic_year", year, i64::from(now.year()))
            .data("is_active", doc.bool_field("isActive").unwrap_or(true));
        let course = super::with_timestamps(course, doc, now);
        out.primary = course.clone();

        let mut keys = ChildKeys::default();
        teacher_rows(id, &course, doc, translator, &mut keys, &mut out);
        for value in doc.array_field("sessions") {
            match Embedded::from_value(value) {
                Some(session) => {
                    self.session(doc, &course, session, translator, &mut keys, &mut out)
                }
                None => {
                    tracing::warn!(source_id = %id, field = "sessions", "non-object session skipped");
                    out.skipped_children += 1;
                }
            }
        }

        let display_name = match year {
            Some(year) => format!("course {year} {}", id.short(6)),
            None => format!("course {}", id.short(6)),
        };
        out.registrations.insert(
            0,
            Registration::for_row(id, EntityKind::Course, &out.primary, display_name),
        );
        Ok(out)
    }
}
