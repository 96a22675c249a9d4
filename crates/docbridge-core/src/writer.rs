//! Idempotent Writer: one source document, one transaction.
//!
//! The primary row's `source_key` is the idempotency key. A document whose
//! primary row already exists is skipped, never updated, so re-running a
//! family after a crash re-derives the same rows and writes only what is
//! missing. A primary row removed by duplicate cleanup counts as existing:
//! its tombstone answers with the surviving row.

use docbridge_target::statements::{find_id_by_source_key, find_tombstone, insert_row};
use docbridge_target::{TargetError, TargetStore};
use uuid::Uuid;

use crate::transform::Transformed;
use crate::translator::IdentifierTranslator;
use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The primary row and all children were committed.
    Inserted { rows: usize },
    /// A row with the same source key exists, or was folded into this
    /// surviving row by duplicate cleanup; nothing was written.
    AlreadyExists(Uuid),
    /// Rolled back. The failure concerns this document only.
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotentWriter;

impl IdempotentWriter {
    /// Write a transformed document and register its entities.
    ///
    /// Record-level failures (constraint violations, conflicting mappings)
    /// come back as [`WriteOutcome::Failed`]. Store failures are returned as
    /// errors after the transaction is rolled back.
    pub fn write<S: TargetStore + ?Sized>(
        store: &mut S,
        doc: &Transformed,
        translator: &mut IdentifierTranslator,
    ) -> Result<WriteOutcome, EngineError> {
        let primary = &doc.primary;
        if let Some(existing) = find_id_by_source_key(&*store, &primary.table, &primary.source_key)? {
            recover_registrations(&*store, doc, translator)?;
            return Ok(WriteOutcome::AlreadyExists(existing));
        }
        if let Some(survivor) = find_tombstone(&*store, &primary.table, &primary.source_key)? {
            tracing::debug!(
                source_id = %primary.source_key,
                table = %primary.table,
                survivor = %survivor,
                "removed as a duplicate, not written again"
            );
            return Ok(WriteOutcome::AlreadyExists(survivor));
        }

        for registration in &doc.registrations {
            if let Err(err) = translator.check_register(registration.source_id, registration.target_key) {
                tracing::warn!(
                    source_id = %registration.source_id,
                    table = %registration.table,
                    error = %err,
                    "mapping conflict, document not written"
                );
                return Ok(WriteOutcome::Failed(err.to_string()));
            }
        }

        store.begin()?;
        for row in doc.rows() {
            if let Err(err) = insert_row(store, row) {
                rollback(store);
                if err.is_record_level() {
                    tracing::warn!(
                        source_id = %primary.source_key,
                        table = %row.table,
                        source_key = %row.source_key,
                        error = %err,
                        "write failed, document rolled back"
                    );
                    return Ok(WriteOutcome::Failed(format!("{}: {err}", row.table)));
                }
                return Err(err.into());
            }
        }
        if let Err(err) = store.commit() {
            rollback(store);
            return Err(err.into());
        }

        for registration in &doc.registrations {
            translator.register(
                registration.source_id,
                registration.target_key,
                registration.descriptor(),
            )?;
        }
        Ok(WriteOutcome::Inserted {
            rows: doc.row_count(),
        })
    }
}

fn rollback<S: TargetStore + ?Sized>(store: &mut S) {
    if let Err(err) = store.rollback() {
        tracing::error!(error = %err, "rollback failed");
    }
}

/// Register the stored keys of entities whose rows exist but whose mapping
/// was lost, e.g. when a run stopped between commit and persist.
fn recover_registrations<S: TargetStore + ?Sized>(
    store: &S,
    doc: &Transformed,
    translator: &mut IdentifierTranslator,
) -> Result<(), TargetError> {
    for registration in &doc.registrations {
        if translator.resolve(registration.source_id).is_some() {
            continue;
        }
        let Some(stored) = find_id_by_source_key(store, &registration.table, &registration.source_key)? else {
            continue;
        };
        match translator.register(registration.source_id, stored, registration.descriptor()) {
            Ok(_) => tracing::info!(
                source_id = %registration.source_id,
                kind = %registration.kind,
                "mapping recovered from target"
            ),
            Err(err) => tracing::warn!(
                source_id = %registration.source_id,
                error = %err,
                "stored row conflicts with mapping"
            ),
        }
    }
    Ok(())
}
