//! Family pipeline: transform, write, persist the mapping, resolve.
//!
//! ```text
//!   for each document (source order):
//!       transform ──► write ──► RecordOutcome ──► RunCounters
//!       every batch_size documents: persist mapping
//!   persist mapping
//!   resolve (pending from this run ∪ NULL references left in the target)
//! ```
//!
//! Per-record failures never stop the family; store failures do.

use docbridge_source::{Filter, SourceError, SourceStore};
use docbridge_target::TargetStore;
use serde::Serialize;

use crate::family::Family;
use crate::resolver::{collect_pending, resolve_pending, ResolutionReport};
use crate::transform::{self, Anomaly, PendingReference, TransformOptions};
use crate::translator::IdentifierTranslator;
use crate::writer::{IdempotentWriter, WriteOutcome};
use crate::EngineError;

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// What happened to one source document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Success { rows: usize },
    AlreadyPresent,
    /// Not transformable (missing or invalid required field).
    Skipped(String),
    /// Transformable but not writable; rolled back.
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub seen: usize,
    pub migrated: usize,
    pub already_present: usize,
    pub skipped: usize,
    pub failed: usize,
    pub child_rows: usize,
    pub children_skipped: usize,
    pub anomalies: usize,
}

impl RunCounters {
    pub fn record(&mut self, outcome: &RecordOutcome) {
        self.seen += 1;
        match outcome {
            RecordOutcome::Success { rows } => {
                self.migrated += 1;
                self.child_rows += rows.saturating_sub(1);
            }
            RecordOutcome::AlreadyPresent => self.already_present += 1,
            RecordOutcome::Skipped(_) => self.skipped += 1,
            RecordOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.skipped > 0 || self.failed > 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FamilyReport {
    pub family: Family,
    pub counters: RunCounters,
    pub anomalies: Vec<Anomaly>,
    pub resolution: ResolutionReport,
}

pub struct Migrator<'a, S: SourceStore + ?Sized, T: TargetStore + ?Sized> {
    source: &'a S,
    target: &'a mut T,
    translator: &'a mut IdentifierTranslator,
    options: TransformOptions,
    batch_size: usize,
}

impl<'a, S: SourceStore + ?Sized, T: TargetStore + ?Sized> Migrator<'a, S, T> {
    pub fn new(source: &'a S, target: &'a mut T, translator: &'a mut IdentifierTranslator) -> Self {
        Self {
            source,
            target,
            translator,
            options: TransformOptions::default(),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_options(mut self, options: TransformOptions) -> Self {
        self.options = options;
        self
    }

    pub fn translator(&self) -> &IdentifierTranslator {
        &*self.translator
    }

    /// Migrate one family, then resolve its deferred references.
    pub fn run_family(&mut self, family: Family) -> Result<FamilyReport, EngineError> {
        self.warn_on_missing_prerequisites(family);

        let docs = match self.source.find(family.collection(), &Filter::all()) {
            Ok(docs) => docs,
            Err(SourceError::UnknownCollection(name)) => {
                tracing::warn!(family = %family, collection = %name, "collection not in source, nothing to migrate");
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        let transformer = transform::for_family(family, self.source, self.options)?;
        tracing::info!(family = %family, documents = docs.len(), "migrating");

        let mut counters = RunCounters::default();
        let mut anomalies = Vec::new();
        let mut pending: Vec<PendingReference> = Vec::new();

        for (index, doc) in docs.iter().enumerate() {
            let outcome = match transformer.transform(doc, self.translator) {
                Err(err) => {
                    tracing::warn!(
                        family = %family,
                        collection = family.collection(),
                        source_id = %doc.id(),
                        error = %err,
                        "document skipped"
                    );
                    RecordOutcome::Skipped(err.to_string())
                }
                Ok(mut out) => {
                    out.drop_forward_references(family);
                    counters.children_skipped += out.skipped_children;
                    match IdempotentWriter::write(self.target, &out, self.translator)? {
                        WriteOutcome::Inserted { rows } => {
                            for anomaly in &out.anomalies {
                                tracing::debug!(source_id = %anomaly.source_id, field = %anomaly.field, detail = %anomaly.detail, "anomaly");
                            }
                            counters.anomalies += out.anomalies.len();
                            anomalies.append(&mut out.anomalies);
                            pending.extend(out.pending());
                            RecordOutcome::Success { rows }
                        }
                        WriteOutcome::AlreadyExists(_) => RecordOutcome::AlreadyPresent,
                        WriteOutcome::Failed(reason) => RecordOutcome::Failed(reason),
                    }
                }
            };
            counters.record(&outcome);

            if (index + 1) % self.batch_size == 0 {
                self.translator.persist()?;
                tracing::info!(
                    family = %family,
                    processed = index + 1,
                    total = docs.len(),
                    migrated = counters.migrated,
                    "batch done"
                );
            }
        }
        self.translator.persist()?;

        let resolution = self.resolve_with(family, pending)?;
        tracing::info!(
            family = %family,
            migrated = counters.migrated,
            already_present = counters.already_present,
            skipped = counters.skipped,
            failed = counters.failed,
            "family done"
        );
        Ok(FamilyReport {
            family,
            counters,
            anomalies,
            resolution,
        })
    }

    /// Every family, lower levels first.
    pub fn run_all(&mut self) -> Result<Vec<FamilyReport>, EngineError> {
        Family::in_dependency_order()
            .into_iter()
            .map(|family| self.run_family(family))
            .collect()
    }

    /// Resolution pass alone, over references left `NULL` in the target.
    pub fn resolve(&mut self, family: Family) -> Result<ResolutionReport, EngineError> {
        self.resolve_with(family, Vec::new())
    }

    fn resolve_with(
        &mut self,
        family: Family,
        mut pending: Vec<PendingReference>,
    ) -> Result<ResolutionReport, EngineError> {
        pending.extend(collect_pending(&*self.target, family)?);
        pending.sort();
        pending.dedup();
        Ok(resolve_pending(self.target, self.translator, &pending)?)
    }

    fn warn_on_missing_prerequisites(&self, family: Family) {
        let mut kinds: Vec<_> = family.deferred_columns().iter().map(|d| d.kind).collect();
        kinds.sort();
        kinds.dedup();
        for kind in kinds {
            if self.translator.count_kind(kind) == 0 {
                tracing::warn!(
                    family = %family,
                    kind = %kind,
                    "no {kind} mappings yet, references will stay pending"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut counters = RunCounters::default();
        counters.record(&RecordOutcome::Success { rows: 4 });
        counters.record(&RecordOutcome::AlreadyPresent);
        counters.record(&RecordOutcome::Skipped("no date".into()));
        counters.record(&RecordOutcome::Failed("constraint".into()));
        assert_eq!(counters.seen, 4);
        assert_eq!(counters.migrated, 1);
        assert_eq!(counters.child_rows, 3);
        assert!(counters.has_failures());
    }
}
