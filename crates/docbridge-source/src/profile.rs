//! Collection profiling.
//!
//! Walks every document of a collection and records, per dotted field path,
//! how often the field is present and which value types were seen:
//! - nested objects contribute `parent.child` paths
//! - arrays contribute `parent[]` paths for their elements
//! - extended JSON wrappers (`$oid`, `$date`, ...) count as scalars

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::document::value_type_name;
use crate::{Fields, SourceDocument};

/// Field statistics for one path.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldProfile {
    /// Number of documents in which the path holds a non-null value.
    pub present: usize,
    pub types: BTreeSet<String>,
}

/// Inferred shape of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionProfile {
    pub documents: usize,
    pub fields: BTreeMap<String, FieldProfile>,
}

impl CollectionProfile {
    /// Share of documents carrying `path`, as a percentage.
    pub fn coverage(&self, path: &str) -> f64 {
        if self.documents == 0 {
            return 0.0;
        }
        let present = self.fields.get(path).map_or(0, |f| f.present);
        present as f64 / self.documents as f64 * 100.0
    }
}

pub fn profile_collection(docs: &[SourceDocument]) -> CollectionProfile {
    let mut profile = CollectionProfile {
        documents: docs.len(),
        ..Default::default()
    };
    for doc in docs {
        // A path counts once per document even when an array repeats it.
        let mut seen = BTreeSet::new();
        for (key, value) in doc.fields() {
            walk(value, key, &mut profile, &mut seen);
        }
        for path in seen {
            if let Some(field) = profile.fields.get_mut(&path) {
                field.present += 1;
            }
        }
    }
    profile
}

fn walk(value: &Value, path: &str, profile: &mut CollectionProfile, seen: &mut BTreeSet<String>) {
    let type_name = value_type_name(value);
    let field = profile.fields.entry(path.to_string()).or_default();
    field.types.insert(type_name.to_string());
    if !value.is_null() {
        seen.insert(path.to_string());
    }

    match value {
        Value::Array(items) => {
            let elem_path = format!("{path}[]");
            for item in items {
                walk(item, &elem_path, profile, seen);
            }
        }
        Value::Object(obj) if type_name == "document" => {
            for (key, child) in obj {
                walk(child, &format!("{path}.{key}"), profile, seen);
            }
        }
        _ => {}
    }
}
