//! Deferred Reference Resolver: the second pass of the two-pass write.
//!
//! Pass one writes rows with `NULL` foreign keys for referents that were not
//! mapped yet. Pass two looks every pending reference up again and patches
//! the column with a targeted update that only fills a `NULL`.

use docbridge_source::ObjectId;
use docbridge_target::statements::{fill_null_column, null_references};
use docbridge_target::{TargetError, TargetStore};
use serde::Serialize;

use crate::family::Family;
use crate::transform::PendingReference;
use crate::translator::IdentifierTranslator;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResolutionReport {
    pub resolved: usize,
    /// Pending references whose column was filled by someone else, or
    /// whose row no longer exists.
    pub already_set: usize,
    /// Sorted, without repeats.
    pub still_missing: Vec<ObjectId>,
}

impl ResolutionReport {
    pub fn merge(&mut self, other: ResolutionReport) {
        self.resolved += other.resolved;
        self.already_set += other.already_set;
        self.still_missing.extend(other.still_missing);
        self.still_missing.sort();
        self.still_missing.dedup();
    }
}

/// Resolve `pending` against the translator and patch the resolved columns.
///
/// Identifiers that are still unmapped are reported, not retried.
pub fn resolve_pending<S: TargetStore + ?Sized>(
    store: &mut S,
    translator: &IdentifierTranslator,
    pending: &[PendingReference],
) -> Result<ResolutionReport, TargetError> {
    let mut report = ResolutionReport::default();
    if pending.is_empty() {
        return Ok(report);
    }

    store.begin()?;
    for reference in pending {
        let key = match Family::deferred_for(&reference.table, &reference.column) {
            Some(deferred) => translator.resolve_kind(reference.source_id, deferred.kind),
            None => translator.resolve(reference.source_id),
        };
        let Some(key) = key else {
            report.still_missing.push(reference.source_id);
            continue;
        };
        match fill_null_column(store, &reference.table, &reference.column, reference.row_id, key.into()) {
            Ok(0) => report.already_set += 1,
            Ok(_) => report.resolved += 1,
            Err(err) if err.is_record_level() => {
                tracing::warn!(
                    table = %reference.table,
                    field = %reference.column,
                    source_id = %reference.source_id,
                    error = %err,
                    "reference could not be written"
                );
                report.still_missing.push(reference.source_id);
            }
            Err(err) => {
                rollback(store);
                return Err(err);
            }
        }
    }
    if let Err(err) = store.commit() {
        rollback(store);
        return Err(err);
    }

    report.still_missing.sort();
    report.still_missing.dedup();
    for source_id in &report.still_missing {
        tracing::warn!(source_id = %source_id, "reference still unresolved");
    }
    tracing::info!(
        resolved = report.resolved,
        already_set = report.already_set,
        missing = report.still_missing.len(),
        "deferred references resolved"
    );
    Ok(report)
}

fn rollback<S: TargetStore + ?Sized>(store: &mut S) {
    if let Err(err) = store.rollback() {
        tracing::error!(error = %err, "rollback failed");
    }
}

/// Every deferred column of `family` that is `NULL` in the target while its
/// source-id column is set, including those left by earlier runs.
pub fn collect_pending<S: TargetStore + ?Sized>(
    store: &S,
    family: Family,
) -> Result<Vec<PendingReference>, TargetError> {
    let mut pending = Vec::new();
    for deferred in family.deferred_columns() {
        for (row_id, raw) in null_references(store, deferred.table, deferred.column, deferred.source_column)? {
            match ObjectId::parse_str(&raw) {
                Ok(source_id) => pending.push(PendingReference {
                    table: deferred.table.to_string(),
                    row_id,
                    column: deferred.column.to_string(),
                    source_id,
                }),
                Err(err) => tracing::warn!(
                    table = deferred.table,
                    field = deferred.source_column,
                    value = %raw,
                    error = %err,
                    "unparsable source id in target"
                ),
            }
        }
    }
    Ok(pending)
}
