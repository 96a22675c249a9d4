use chrono::{DateTime, Duration, Utc};
use docbridge_source::{Embedded, Fields, Filter, ObjectId, SourceDocument, SourceError, SourceStore};
use docbridge_target::TargetRow;
use std::collections::HashMap;

use super::{
    child_key, mean, required_date, required_id, with_timestamps, AnomalyKind, ChildKeys,
    EntityTransformer, Registration, TransformError, TransformOptions, Transformed,
};
use crate::family::{EntityKind, Family};
use crate::translator::IdentifierTranslator;

/// Courses created further than this from a behavior are never matched by
/// the nearest-date fallback.
pub const NEAREST_COURSE_WINDOW_DAYS: i64 = 180;

#[derive(Debug, Clone)]
struct IndexedCourse {
    id: ObjectId,
    created_at: DateTime<Utc>,
    sessions: Vec<ObjectId>,
}

/// Source courses and their sessions, for behaviors whose `course` field
/// may name a course, a session, or nothing that still exists.
#[derive(Debug, Clone, Default)]
pub struct CourseIndex {
    courses: Vec<IndexedCourse>,
    session_course: HashMap<ObjectId, ObjectId>,
}

/// How a behavior's `course` value was linked to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMatch {
    Session(ObjectId),
    /// The value named a course; its first session was used.
    CourseFirstSession { course: ObjectId, session: ObjectId },
    /// Nothing matched; the course created nearest to the behavior was used.
    Nearest { course: ObjectId, session: ObjectId, days: i64 },
    Unmatched,
}

impl SessionMatch {
    pub fn session(self) -> Option<ObjectId> {
        match self {
            SessionMatch::Session(s)
            | SessionMatch::CourseFirstSession { session: s, .. }
            | SessionMatch::Nearest { session: s, .. } => Some(s),
            SessionMatch::Unmatched => None,
        }
    }
}

impl CourseIndex {
    pub fn from_source<S: SourceStore + ?Sized>(source: &S) -> Result<Self, SourceError> {
        let docs = match source.find(Family::Courses.collection(), &Filter::all()) {
            Ok(docs) => docs,
            Err(SourceError::UnknownCollection(name)) => {
                tracing::warn!(collection = %name, "no courses to link behaviors against");
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(Self::from_documents(&docs))
    }

    pub fn from_documents(docs: &[SourceDocument]) -> Self {
        let mut index = Self::default();
        for doc in docs {
            let sessions: Vec<ObjectId> = doc
                .array_field("sessions")
                .iter()
                .filter_map(Embedded::from_value)
                .filter_map(|s| s.object_id_field("_id"))
                .collect();
            for session in &sessions {
                index.session_course.insert(*session, doc.id());
            }
            index.courses.push(IndexedCourse {
                id: doc.id(),
                created_at: doc.created_at(),
                sessions,
            });
        }
        index
    }

    pub fn len(&self) -> usize {
        self.courses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.courses.is_empty()
    }

    pub fn course_of_session(&self, session: ObjectId) -> Option<ObjectId> {
        self.session_course.get(&session).copied()
    }

    pub fn link(&self, raw: ObjectId, at: DateTime<Utc>, nearest_fallback: bool) -> SessionMatch {
        if self.session_course.contains_key(&raw) {
            return SessionMatch::Session(raw);
        }
        if let Some(course) = self.courses.iter().find(|c| c.id == raw) {
            if let Some(&session) = course.sessions.first() {
                return SessionMatch::CourseFirstSession { course: raw, session };
            }
        }
        if !nearest_fallback {
            return SessionMatch::Unmatched;
        }
        let window = Duration::days(NEAREST_COURSE_WINDOW_DAYS).num_seconds();
        self.courses
            .iter()
            .filter(|c| !c.sessions.is_empty())
            .map(|c| (c, (c.created_at - at).num_seconds().abs()))
            .filter(|(_, distance)| *distance <= window)
            .min_by_key(|(c, distance)| (*distance, c.id))
            .and_then(|(c, distance)| {
                Some(SessionMatch::Nearest {
                    course: c.id,
                    session: *c.sessions.first()?,
                    days: distance / 86_400,
                })
            })
            .unwrap_or(SessionMatch::Unmatched)
    }
}

/// `behaviornews` → `behaviors` + `behavior_records`.
#[derive(Debug, Clone)]
pub struct BehaviorTransformer {
    options: TransformOptions,
    index: CourseIndex,
}

impl BehaviorTransformer {
    pub fn new(options: TransformOptions, index: CourseIndex) -> Self {
        Self { options, index }
    }
}

impl EntityTransformer for BehaviorTransformer {
    fn family(&self) -> Family {
        Family::Behaviors
    }

    fn transform(
        &self,
        doc: &SourceDocument,
        translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError> {
        let id = doc.id();
        let now = self.options.now;
        let raw = required_id(doc, id, "course")?;
        let date = required_date(doc, id, "date")?;
        let at = doc.datetime_field("date").unwrap_or_else(|| doc.created_at());

        let key = id.to_string();
        let mut keys = ChildKeys::default();
        let mut records = Vec::new();
        let mut skipped = 0;
        for value in doc.array_field("records") {
            let Some(record) = Embedded::from_value(value) else {
                skipped += 1;
                continue;
            };
            let (Some(student), Some(rating)) =
                (record.object_id_field("student"), record.f64_field("rating"))
            else {
                tracing::warn!(source_id = %id, "behavior record without student or rating skipped");
                skipped += 1;
                continue;
            };
            let record_key = child_key(&key, "record", student);
            if !keys.claim(&record_key) {
                skipped += 1;
                continue;
            }
            records.push((record_key, student, rating, record));
        }
        let ratings: Vec<f64> = records.iter().map(|(_, _, rating, _)| *rating).collect();

        let linked = self.index.link(raw, at, self.options.nearest_date_fallback);
        // Unmatched values are kept as-is so a later resolution can still
        // find them if they turn out to be session ids.
        let session = linked.session().unwrap_or(raw);

        let row = TargetRow::new("behaviors", key)
            .reference(
                "course_session_id",
                session,
                translator.resolve_kind(session, EntityKind::Session),
            )
            .data("mongo_course_id", raw.to_string())
            .data("mongo_session_id", session.to_string())
            .data("date", date)
            .data("behavior_rate", mean(&ratings))
            .data("total_students", records.len());
        let mut out = Transformed::new(with_timestamps(row, doc, now));
        out.skipped_children = skipped;

        match linked {
            SessionMatch::Session(_) => {}
            SessionMatch::CourseFirstSession { course, session } => out.anomaly(
                id,
                "course",
                AnomalyKind::Defaulted,
                format!("course {course} linked through its first session {session}"),
            ),
            SessionMatch::Nearest { course, session, days } => out.anomaly(
                id,
                "course",
                AnomalyKind::HeuristicMatch,
                format!("unknown course {raw}, matched course {course} session {session} created {days} days away"),
            ),
            SessionMatch::Unmatched => out.anomaly(
                id,
                "course",
                AnomalyKind::InvalidValue,
                format!("{raw} matches no known course or session"),
            ),
        }

        for (record_key, student, rating, record) in records {
            let row = TargetRow::new("behavior_records", record_key)
                .parent("behavior_id", &out.primary)
                .data("mongo_student_id", student.to_string())
                .reference(
                    "student_id",
                    student,
                    translator.resolve_kind(student, EntityKind::User),
                )
                .data("rating", rating)
                .data("comment", record.str_field("comment"));
            out.children.push(with_timestamps(row, &record, now));
        }

        out.registrations.push(Registration::for_row(
            id,
            EntityKind::Behavior,
            &out.primary,
            format!("behavior {date}"),
        ));
        Ok(out)
    }
}
