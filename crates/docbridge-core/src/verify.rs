//! Consistency Verifier: compares the source with what the target holds.
//!
//! Each source document is transformed again (read-only, against the
//! current mapping) and the expected rows are compared with the stored ones:
//!
//! - presence of every expected row, and no target row without a source
//! - `Data` columns: exact, numbers within [`NUMERIC_TOLERANCE`]
//! - `Reference` columns: the stored key is the mapped key of the source id
//! - `Parent` columns: the stored key is the stored parent's id
//! - children: per parent, the stored set of child source keys equals the
//!   expected set (order is not significant)
//!
//! `Volatile` columns hold clock defaults and are skipped. Nothing is ever
//! written, and every mismatch is collected; the report is always complete.

use chrono::{DateTime, Utc};
use docbridge_source::{Filter, SourceDocument, SourceError, SourceStore};
use docbridge_target::statements::{child_source_keys, count_rows, fetch_by_source_key, source_keys};
use docbridge_target::{ColumnRole, SqlRow, SqlValue, TargetRow, TargetStore};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::family::Family;
use crate::transform::{self, TransformOptions};
use crate::translator::IdentifierTranslator;
use crate::EngineError;

/// Absolute tolerance for numeric columns.
pub const NUMERIC_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Discrepancy {
    /// Target table.
    pub entity_type: String,
    pub source_identifier: String,
    pub field: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub family: Family,
    pub generated_at: DateTime<Utc>,
    pub source_documents: usize,
    pub target_rows: usize,
    /// Rows found and compared, children included.
    pub rows_compared: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }

    /// Discrepancy counts per `table.field`.
    pub fn summary(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for d in &self.discrepancies {
            *counts
                .entry(format!("{}.{}", d.entity_type, d.field))
                .or_insert(0) += 1;
        }
        counts
    }

    /// Write `verify_<family>_<timestamp>.json` into `dir`.
    pub fn write_json(&self, dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "verify_{}_{}.json",
            self.family,
            self.generated_at.format("%Y%m%d_%H%M%S")
        ));
        let json = serde_json::to_string_pretty(self).map_err(io::Error::from)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    fn push(&mut self, table: &str, source: &str, field: &str, expected: impl ToString, actual: impl ToString) {
        self.discrepancies.push(Discrepancy {
            entity_type: table.to_string(),
            source_identifier: source.to_string(),
            field: field.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
}

pub struct Verifier<'a, S: SourceStore + ?Sized, T: TargetStore + ?Sized> {
    source: &'a S,
    target: &'a T,
    translator: &'a IdentifierTranslator,
    options: TransformOptions,
}

impl<'a, S: SourceStore + ?Sized, T: TargetStore + ?Sized> Verifier<'a, S, T> {
    pub fn new(source: &'a S, target: &'a T, translator: &'a IdentifierTranslator) -> Self {
        Self {
            source,
            target,
            translator,
            options: TransformOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransformOptions) -> Self {
        self.options = options;
        self
    }

    /// Store failures are returned as errors; everything else ends up in
    /// the report.
    pub fn verify(&self, family: Family) -> Result<ReconciliationReport, EngineError> {
        let table = family.primary_table();
        let docs = match self.source.find(family.collection(), &Filter::all()) {
            Ok(docs) => docs,
            Err(SourceError::UnknownCollection(name)) => {
                tracing::warn!(collection = %name, "collection not in source");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        let transformer = transform::for_family(family, self.source, self.options)?;

        let mut report = ReconciliationReport {
            family,
            generated_at: self.options.now,
            source_documents: docs.len(),
            target_rows: count_rows(self.target, table)?,
            rows_compared: 0,
            discrepancies: Vec::new(),
        };

        let mut expected_keys = BTreeSet::new();
        for doc in &docs {
            expected_keys.insert(doc.id().to_string());
            match transformer.transform(doc, self.translator) {
                Ok(mut expected) => {
                    expected.drop_forward_references(family);
                    self.compare_document(family, doc, expected.rows(), &mut report)?;
                }
                Err(err) => report.push(table, &doc.id().to_string(), "document", "migrated", err),
            }
        }

        for (id, key) in source_keys(self.target, table)? {
            if !expected_keys.contains(&key) {
                report.push(table, &key, "row", "no row (no source document)", id);
            }
        }
        if report.source_documents != report.target_rows {
            report.push(table, "*", "row_count", report.source_documents, report.target_rows);
        }

        tracing::info!(
            family = %family,
            documents = report.source_documents,
            rows = report.rows_compared,
            discrepancies = report.discrepancies.len(),
            "verification finished"
        );
        Ok(report)
    }

    fn compare_document<'r>(
        &self,
        family: Family,
        doc: &SourceDocument,
        rows: impl Iterator<Item = &'r TargetRow>,
        report: &mut ReconciliationReport,
    ) -> Result<(), EngineError> {
        let source = doc.id().to_string();
        let rows: Vec<&TargetRow> = rows.collect();

        // Stored ids of the rows found, by (table, source_key).
        let mut stored_ids: HashMap<(&str, &str), Uuid> = HashMap::new();
        for row in &rows {
            let Some(stored) = fetch_by_source_key(self.target, &row.table, &row.source_key)? else {
                // Missing children are reported with their parent's child set.
                if row.table == family.primary_table() {
                    report.push(&row.table, &source, "row", "present", "missing");
                }
                continue;
            };
            report.rows_compared += 1;
            if let Some(id) = stored.uuid("id") {
                stored_ids.insert((row.table.as_str(), row.source_key.as_str()), id);
            }
            self.compare_row(row, &stored, &stored_ids, &source, report);
        }

        for relation in family.child_relations() {
            for parent in rows.iter().filter(|r| r.table == relation.parent_table) {
                let Some(&parent_id) = stored_ids.get(&(parent.table.as_str(), parent.source_key.as_str())) else {
                    continue;
                };
                let expected: BTreeSet<String> = rows
                    .iter()
                    .filter(|r| r.table == relation.table)
                    .filter(|r| {
                        matches!(
                            r.column(relation.parent_column).map(|c| &c.role),
                            Some(ColumnRole::Parent { source_key }) if *source_key == parent.source_key
                        )
                    })
                    .map(|r| r.source_key.clone())
                    .collect();
                let actual = child_source_keys(self.target, relation.table, relation.parent_column, parent_id)?;
                if expected != actual {
                    let missing: Vec<_> = expected.difference(&actual).cloned().collect();
                    let extra: Vec<_> = actual.difference(&expected).cloned().collect();
                    report.push(
                        relation.table,
                        &parent.source_key,
                        relation.parent_column,
                        format!("{} rows, missing [{}]", expected.len(), missing.join(", ")),
                        format!("{} rows, unexpected [{}]", actual.len(), extra.join(", ")),
                    );
                }
            }
        }
        Ok(())
    }

    fn compare_row(
        &self,
        row: &TargetRow,
        stored: &SqlRow,
        stored_ids: &HashMap<(&str, &str), Uuid>,
        source: &str,
        report: &mut ReconciliationReport,
    ) {
        let null = SqlValue::Null;
        for column in &row.columns {
            let actual = stored.get(&column.name).unwrap_or(&null);
            match &column.role {
                ColumnRole::Volatile => {}
                ColumnRole::Data => {
                    if !column.value.approx_eq(actual, NUMERIC_TOLERANCE) {
                        report.push(&row.table, &row.source_key, &column.name, &column.value, actual);
                    }
                }
                ColumnRole::Parent { source_key } => {
                    let parent = stored_ids
                        .iter()
                        .find(|((_, key), _)| *key == source_key.as_str())
                        .map(|(_, id)| *id);
                    if let Some(parent) = parent {
                        if actual.as_uuid() != Some(parent) {
                            report.push(&row.table, &row.source_key, &column.name, parent, actual);
                        }
                    }
                }
                ColumnRole::Reference { source_id } => {
                    let expected = match column.value.as_uuid() {
                        Some(key) => Some(key),
                        None => self.translator.resolve(*source_id),
                    };
                    match (expected, actual.as_uuid()) {
                        (Some(e), Some(a)) if e == a => {}
                        (None, None) => report.push(
                            &row.table,
                            &row.source_key,
                            &column.name,
                            format!("mapping for {source_id}"),
                            "unresolved reference",
                        ),
                        (Some(e), None) => report.push(
                            &row.table,
                            &row.source_key,
                            &column.name,
                            e,
                            format!("NULL (pending {source_id})"),
                        ),
                        (e, a) => report.push(
                            &row.table,
                            &row.source_key,
                            &column.name,
                            e.map_or_else(|| "NULL".to_string(), |k| k.to_string()),
                            a.map_or_else(|| actual.to_string(), |k| k.to_string()),
                        ),
                    }
                }
            }
        }
        tracing::debug!(source_id = %source, table = %row.table, source_key = %row.source_key, "row compared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{EntityTransformer, UserTransformer};
    use crate::writer::IdempotentWriter;
    use docbridge_source::MemorySource;
    use docbridge_target::statements::update_column;
    use docbridge_target::SqliteTarget;
    use serde_json::json;

    fn users() -> MemorySource {
        MemorySource::new()
            .with_json(
                "users",
                vec![
                    json!({"_id": "5f1a2b3c4d5e6f7a8b9c0d1e", "firstname": "Amina", "role": "student"}),
                    json!({"_id": "5f1a2b3c4d5e6f7a8b9c0d1f", "firstname": "Yusuf", "role": "teacher"}),
                ],
            )
            .unwrap()
    }

    fn migrated(source: &MemorySource) -> (SqliteTarget, IdentifierTranslator) {
        let mut target = SqliteTarget::open_in_memory().unwrap();
        target.ensure_schema().unwrap();
        let mut translator = IdentifierTranslator::new();
        let transformer = UserTransformer::new(TransformOptions::default());
        for doc in source.find("users", &Filter::all()).unwrap() {
            let out = transformer.transform(&doc, &translator).unwrap();
            IdempotentWriter::write(&mut target, &out, &mut translator).unwrap();
        }
        (target, translator)
    }

    #[test]
    fn test_clean_migration_verifies() {
        let source = users();
        let (target, translator) = migrated(&source);
        let report = Verifier::new(&source, &target, &translator)
            .verify(Family::Users)
            .unwrap();
        assert!(report.is_clean(), "{:?}", report.discrepancies);
        assert_eq!(report.rows_compared, 2);
    }

    #[test]
    fn test_changed_value_and_missing_row_are_reported() {
        let source = users();
        let (mut target, translator) = migrated(&source);
        let amina = fetch_by_source_key(&target, "users", "5f1a2b3c4d5e6f7a8b9c0d1e")
            .unwrap()
            .unwrap();
        update_column(&mut target, "users", "role", amina.uuid("id").unwrap(), "admin".into()).unwrap();

        let mut source = source;
        source.insert_collection(
            "users",
            vec![
                SourceDocument::from_value(json!({"_id": "5f1a2b3c4d5e6f7a8b9c0d1e", "firstname": "Amina", "role": "student"})).unwrap(),
                SourceDocument::from_value(json!({"_id": "5f1a2b3c4d5e6f7a8b9c0d1f", "firstname": "Yusuf", "role": "teacher"})).unwrap(),
                SourceDocument::from_value(json!({"_id": "5f1a2b3c4d5e6f7a8b9c0d20", "firstname": "Late"})).unwrap(),
            ],
        );

        let report = Verifier::new(&source, &target, &translator)
            .verify(Family::Users)
            .unwrap();
        let fields: Vec<_> = report.discrepancies.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["role", "row", "row_count"]);
        assert_eq!(report.discrepancies[0].expected, "student");
        assert_eq!(report.discrepancies[0].actual, "admin");
        assert_eq!(report.summary().get("users.row"), Some(&1));
    }

    #[test]
    fn test_report_is_written_as_json() {
        let source = users();
        let (target, translator) = migrated(&source);
        let report = Verifier::new(&source, &target, &translator)
            .verify(Family::Users)
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = report.write_json(dir.path()).unwrap();
        assert!(path.file_name().unwrap().to_string_lossy().starts_with("verify_users_"));
        let value: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["family"], "users");
    }
}
