//! Target side of a docbridge migration: the relational store.
//!
//! ```text
//!   TargetRow ──statements──► TargetStore (SqliteTarget)
//!        ▲                         │
//!        │                    Catalog (parsed DDL)
//!   transformers              validates identifiers
//! ```
//!
//! Every statement the engine issues is parameterised; only table and
//! column names are interpolated, and those are checked against the
//! [`Catalog`] first.

pub mod row;
pub mod schema;
pub mod statements;
pub mod store;
pub mod value;

pub use row::{Column, ColumnRole, SqlRow, TargetRow};
pub use schema::{Catalog, ColumnDef, ForeignKey, TableDef, UniqueKey};
pub use store::{SqliteTarget, TargetStore};
pub use value::SqlValue;

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("unknown column `{table}.{column}`")]
    UnknownColumn { table: String, column: String },
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("unexpected value in `{column}`: {value}")]
    Decode { column: String, value: String },
}

impl TargetError {
    /// Failures confined to the record being written, as opposed to
    /// failures of the store itself.
    pub fn is_record_level(&self) -> bool {
        matches!(self, TargetError::Constraint(_))
    }
}

impl From<rusqlite::Error> for TargetError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, msg) if e.code == ErrorCode::ConstraintViolation => {
                TargetError::Constraint(msg.clone().unwrap_or_else(|| e.to_string()))
            }
            _ => TargetError::Sqlite(err),
        }
    }
}
