use docbridge_source::{Embedded, Fields, SourceDocument};
use docbridge_target::TargetRow;

use super::{
    with_timestamps, EntityTransformer, Registration, TransformError, TransformOptions,
    Transformed,
};
use crate::family::{EntityKind, Family};
use crate::translator::IdentifierTranslator;

/// `studentstats` → `student_stats` + `student_stats_absences`.
///
/// `absences_count` is the number of absence rows written, which is what
/// duplicate reconciliation later recounts.
#[derive(Debug, Clone)]
pub struct StatsTransformer {
    options: TransformOptions,
}

impl StatsTransformer {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }
}

impl EntityTransformer for StatsTransformer {
    fn family(&self) -> Family {
        Family::Statistics
    }

    fn transform(
        &self,
        doc: &SourceDocument,
        translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError> {
        let id = doc.id();
        let now = self.options.now;
        let user = super::required_id(doc, id, "userId")?;
        let key = id.to_string();

        let mut absences = Vec::new();
        let mut skipped = 0;
        for (index, value) in doc.array_field("absences").iter().enumerate() {
            let Some(absence) = Embedded::from_value(value) else {
                skipped += 1;
                continue;
            };
            let Some(date) = absence.datetime_field("date") else {
                tracing::warn!(source_id = %id, index, "absence without date skipped");
                skipped += 1;
                continue;
            };
            absences.push((index, date.date_naive(), absence));
        }

        let row = TargetRow::new("student_stats", key.clone())
            .reference(
                "user_id",
                user,
                translator.resolve_kind(user, EntityKind::User),
            )
            .data("mongo_user_id", user.to_string())
            .data("absences_count", absences.len())
            .data("behavior_average", doc.f64_field("behaviorAverage"))
            .data_or_volatile("last_update", doc.datetime_field("lastUpdate"), now);
        let mut out = Transformed::new(with_timestamps(row, doc, now));
        out.skipped_children = skipped;

        for (index, date, absence) in absences {
            let mut row = TargetRow::new("student_stats_absences", format!("{key}/absence/{index}"))
                .parent("student_stats_id", &out.primary)
                .data("date", date);
            if let Some(session) = absence.object_id_field("course") {
                row = row
                    .reference(
                        "course_session_id",
                        session,
                        translator.resolve_kind(session, EntityKind::Session),
                    )
                    .data("mongo_session_id", session.to_string());
            }
            out.children.push(with_timestamps(row, &absence, now));
        }

        let display_name = match translator.descriptor(user) {
            Some(entry) if !entry.display_name.is_empty() => {
                format!("stats {}", entry.display_name)
            }
            _ => format!("stats {}", user.short(6)),
        };
        out.registrations.push(Registration::for_row(
            id,
            EntityKind::StudentStats,
            &out.primary,
            display_name,
        ));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::Descriptor;
    use docbridge_source::ObjectId;
    use docbridge_target::{ColumnRole, SqlValue};
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_absences_become_children() {
        let user = ObjectId::parse_str("5f1a2b3c4d5e6f7a8b9c0d1e").unwrap();
        let user_key = Uuid::new_v4();
        let mut translator = IdentifierTranslator::new();
        translator
            .register(user, user_key, Descriptor::new(EntityKind::User, "Amina K"))
            .unwrap();

        let doc = SourceDocument::from_value(json!({
            "_id": "6733728d9c906b85f3705d5e",
            "userId": {"$oid": "5f1a2b3c4d5e6f7a8b9c0d1e"},
            "behaviorAverage": 3.5,
            "absences": [
                {"date": "2024-01-10", "course": "6733728d9c906b85f3705d5f"},
                {"date": "2024-01-17"},
                {"course": "6733728d9c906b85f3705d5f"}
            ]
        }))
        .unwrap();

        let out = StatsTransformer::new(TransformOptions::default())
            .transform(&doc, &translator)
            .unwrap();
        assert_eq!(out.primary.value("user_id"), Some(&SqlValue::Uuid(user_key)));
        assert_eq!(out.primary.value("absences_count"), Some(&SqlValue::Int(2)));
        assert_eq!(out.primary.column("last_update").unwrap().role, ColumnRole::Volatile);
        assert_eq!(out.children.len(), 2);
        assert_eq!(out.skipped_children, 1);
        assert_eq!(out.pending().len(), 1);
        assert_eq!(out.registrations[0].display_name, "stats Amina K");
    }
}
