//! Source side of a docbridge migration.
//!
//! The source is a read-only set of named document collections, normally a
//! directory of `mongoexport` dumps:
//!
//! ```text
//!   dump/
//!     users.json          [ {"_id": {"$oid": ..}, ...}, ... ]
//!     coursenews.jsonl    {"_id": ..}\n{"_id": ..}\n...
//! ```
//!
//! Every document carries a 12-byte [`ObjectId`]; fields are read through the
//! [`Fields`] trait, which understands extended JSON.

pub mod document;
pub mod object_id;
pub mod profile;
pub mod store;

pub use document::{Embedded, Fields, ReferenceList, SourceDocument};
pub use object_id::ObjectId;
pub use profile::{profile_collection, CollectionProfile, FieldProfile};
pub use store::{Filter, MemorySource, SourceStore};

use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid object id `{0}`")]
    InvalidObjectId(String),
    #[error("invalid document: {0}")]
    InvalidDocument(String),
    #[error("{path}:{record}: {message}")]
    Located {
        path: PathBuf,
        record: usize,
        message: String,
    },
    #[error("unknown collection `{0}`")]
    UnknownCollection(String),
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SourceError {
    /// Attach the dump file and record number (1-based) to a decoding error.
    pub fn at(self, path: &Path, record: usize) -> Self {
        Self::Located {
            path: path.to_path_buf(),
            record,
            message: self.to_string(),
        }
    }
}
