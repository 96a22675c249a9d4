//! Reference coverage: how many of a family's references are already
//! mapped, before migrating it.

use docbridge_source::{Filter, ObjectId, SourceStore};
use docbridge_target::ColumnRole;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::family::Family;
use crate::transform::{self, TransformOptions};
use crate::translator::IdentifierTranslator;
use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageReport {
    pub family: Family,
    pub documents: usize,
    /// Documents that could not be transformed and were not counted.
    pub untransformable: usize,
    pub unique_references: usize,
    pub found: usize,
    /// Unmapped source id → number of uses.
    pub missing: BTreeMap<ObjectId, usize>,
    pub percentage: f64,
}

impl CoverageReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Missing ids, most used first.
    pub fn most_used_missing(&self, limit: usize) -> Vec<(ObjectId, usize)> {
        let mut missing: Vec<_> = self.missing.iter().map(|(id, n)| (*id, *n)).collect();
        missing.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        missing.truncate(limit);
        missing
    }
}

/// Read-only. Counts every cross-entity reference the family's documents
/// would write and checks it against the translator.
pub fn reference_coverage<S: SourceStore + ?Sized>(
    source: &S,
    translator: &IdentifierTranslator,
    family: Family,
) -> Result<CoverageReport, EngineError> {
    let docs = source.find(family.collection(), &Filter::all())?;
    let transformer = transform::for_family(family, source, TransformOptions::default())?;

    let mut uses: BTreeMap<ObjectId, usize> = BTreeMap::new();
    let mut untransformable = 0;
    for doc in &docs {
        let Ok(out) = transformer.transform(doc, translator) else {
            untransformable += 1;
            continue;
        };
        for row in out.rows() {
            for column in &row.columns {
                if let ColumnRole::Reference { source_id } = column.role {
                    *uses.entry(source_id).or_insert(0) += 1;
                }
            }
        }
    }

    let unique_references = uses.len();
    let missing: BTreeMap<ObjectId, usize> = uses
        .into_iter()
        .filter(|(id, _)| translator.resolve(*id).is_none())
        .collect();
    let found = unique_references - missing.len();
    let percentage = if unique_references == 0 {
        100.0
    } else {
        found as f64 / unique_references as f64 * 100.0
    };

    tracing::info!(family = %family, unique_references, found, missing = missing.len(), "reference coverage");
    Ok(CoverageReport {
        family,
        documents: docs.len(),
        untransformable,
        unique_references,
        found,
        missing,
        percentage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::EntityKind;
    use crate::translator::Descriptor;
    use docbridge_source::MemorySource;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn test_counts_unique_and_missing_references() {
        let source = MemorySource::new()
            .with_json(
                "attendancenews",
                vec![
                    json!({"_id": "6733728d9c906b85f3705d01", "course": "6733728d9c906b85f3705d5f", "date": "2024-01-10",
                           "records": [{"student": "5f1a2b3c4d5e6f7a8b9c0d1e"}, {"student": "5f1a2b3c4d5e6f7a8b9c0d1f"}]}),
                    json!({"_id": "6733728d9c906b85f3705d02", "course": "6733728d9c906b85f3705d5f", "date": "2024-01-17",
                           "records": [{"student": "5f1a2b3c4d5e6f7a8b9c0d1f"}]}),
                    json!({"_id": "6733728d9c906b85f3705d03", "date": "2024-01-24"}),
                ],
            )
            .unwrap();
        let mut translator = IdentifierTranslator::new();
        translator
            .register(
                ObjectId::parse_str("5f1a2b3c4d5e6f7a8b9c0d1e").unwrap(),
                Uuid::new_v4(),
                Descriptor::new(EntityKind::User, "a"),
            )
            .unwrap();

        let report = reference_coverage(&source, &translator, Family::Attendances).unwrap();
        assert_eq!(report.documents, 3);
        assert_eq!(report.untransformable, 1);
        assert_eq!(report.unique_references, 3);
        assert_eq!(report.found, 1);
        approx::assert_abs_diff_eq!(report.percentage, 33.333, epsilon = 0.001);

        let top = report.most_used_missing(1);
        assert_eq!(top[0].1, 2);
        assert!(!report.is_complete());
    }
}
