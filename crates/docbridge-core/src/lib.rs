//! docbridge reconciliation engine
//!
//! Moves document-store collections into a relational schema, one entity
//! family at a time, and keeps the two stores reconcilable afterwards:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         ONE ENTITY FAMILY                           │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                                                                     │
//! │  SourceStore ──► EntityTransformer ──► IdempotentWriter ──► Target  │
//! │                        │    ▲                  │                    │
//! │                resolve │    │ register         │ pending refs       │
//! │                        ▼    │                  ▼                    │
//! │                 IdentifierTranslator ◄── DeferredReferenceResolver  │
//! │                        │                                            │
//! │                        ▼ persist after every batch                  │
//! │                  mapping snapshot (JSON)                            │
//! │                                                                     │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   afterwards:  Verifier (read-only)      DuplicateReconciler
//!                source ⇄ target report    identify → backup → delete
//!                                          → reaggregate → verify
//! ```
//!
//! Families run in dependency order (users, courses, then the per-session
//! families, then statistics). A reference to an entity that is not yet
//! mapped is written `NULL` and patched by the resolver pass, so partial
//! and out-of-order runs converge.

pub mod config;
pub mod coverage;
pub mod dedup;
pub mod family;
pub mod pipeline;
pub mod resolver;
pub mod transform;
pub mod translator;
pub mod verify;
pub mod writer;


pub use config::{ConfigError, MigrationConfig};
pub use coverage::{reference_coverage, CoverageReport};
pub use dedup::{DedupError, DedupReport, DedupSpec, DuplicateReconciler};
pub use family::{EntityKind, Family};
pub use pipeline::{FamilyReport, Migrator, RecordOutcome, RunCounters};
pub use resolver::{collect_pending, resolve_pending, ResolutionReport};
pub use transform::{
    Anomaly, AnomalyKind, EntityTransformer, PendingReference, TransformError, TransformOptions,
    Transformed,
};
pub use translator::{Descriptor, IdentifierTranslator, MappingEntry, MappingSnapshot, TranslatorError};
pub use verify::{Discrepancy, ReconciliationReport, Verifier};
pub use writer::{IdempotentWriter, WriteOutcome};

use docbridge_source::SourceError;
use docbridge_target::TargetError;

/// Failures that end a run, as opposed to per-record outcomes.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Translator(#[from] TranslatorError),
}
