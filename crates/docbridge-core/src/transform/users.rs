use docbridge_source::{Fields, SourceDocument};
use docbridge_target::TargetRow;
use serde_json::Value;

use super::{
    with_timestamps, AnomalyKind, EntityTransformer, Registration, TransformError, TransformOptions,
    Transformed,
};
use crate::family::{EntityKind, Family};
use crate::translator::IdentifierTranslator;

/// `users` → `users`.
#[derive(Debug, Clone)]
pub struct UserTransformer {
    options: TransformOptions,
}

impl UserTransformer {
    pub fn new(options: TransformOptions) -> Self {
        Self { options }
    }
}

impl EntityTransformer for UserTransformer {
    fn family(&self) -> Family {
        Family::Users
    }

    fn transform(
        &self,
        doc: &SourceDocument,
        _translator: &IdentifierTranslator,
    ) -> Result<Transformed, TransformError> {
        let id = doc.id();
        let firstname = doc.str_field("firstname").filter(|s| !s.trim().is_empty());
        let lastname = doc.str_field("lastname").filter(|s| !s.trim().is_empty());
        let email = doc.str_field("email");
        // Stored as the JSON array text so it round-trips unchanged.
        let subjects = Value::Array(doc.array_field("subjects").to_vec()).to_string();

        let row = TargetRow::new("users", id.to_string())
            .data("role", doc.str_field("role").unwrap_or("student"))
            .data("firstname", firstname)
            .data("lastname", lastname)
            .data("email", email)
            .data("secondary_email", doc.str_field("secondaryEmail"))
            .data("has_invalid_email", doc.bool_field("hasInvalidEmail").unwrap_or(false))
            .data("phone", doc.text_field("phone"))
            .data(
                "date_of_birth",
                doc.datetime_field("dateOfBirth").map(|t| t.date_naive()),
            )
            .data("gender", doc.str_field("gender"))
            .data("type", doc.str_field("type"))
            .data("subjects", subjects)
            .data("school_year", doc.text_field("schoolYear"))
            .data("is_active", doc.bool_field("isActive").unwrap_or(true))
            .data("deleted_at", doc.datetime_field("deletedAt"))
            .data("stats_model", doc.str_field("statsModel"));
        let row = with_timestamps(row, doc, self.options.now);

        let display_name = match (firstname, lastname) {
            (None, None) => email.unwrap_or_default().to_string(),
            (first, last) => format!("{} {}", first.unwrap_or_default(), last.unwrap_or_default())
                .trim()
                .to_string(),
        };

        let mut out = Transformed::new(row);
        // Nameless accounts are still migrated so their references resolve.
        for (field, value) in [("firstname", firstname), ("lastname", lastname)] {
            if value.is_none() {
                out.anomaly(
                    id,
                    field,
                    AnomalyKind::MissingField,
                    format!("user has no {field}"),
                );
            }
        }
        out.registrations.push(Registration::for_row(
            id,
            EntityKind::User,
            &out.primary,
            display_name,
        ));
        Ok(out)
    }
}
