//! Read-only collection access.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::{Fields, ObjectId, SourceDocument, SourceError};

/// Conjunction of field equality predicates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    equals: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every document.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    pub fn by_id(id: &ObjectId) -> Self {
        Self::eq("_id", id.to_string())
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, doc: &SourceDocument) -> bool {
        self.equals.iter().all(|(field, expected)| {
            if field == "_id" {
                return expected
                    .as_str()
                    .map_or(false, |s| s == doc.id().to_string());
            }
            match (doc.get(field), expected) {
                (Some(actual), expected) if actual == expected => true,
                // Identifiers may be stored as `{"$oid": ..}` and queried as hex.
                (Some(actual), Value::String(s)) => crate::document::decode_object_id(actual)
                    .map_or(false, |id| id.to_string() == *s),
                (None, Value::Null) => true,
                _ => false,
            }
        })
    }
}

/// Read-only access to named document collections.
///
/// There is deliberately no write operation: the migration never mutates
/// the source.
pub trait SourceStore {
    fn collection_names(&self) -> Vec<String>;

    /// Documents of `collection` matching `filter`, in source iteration order.
    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<SourceDocument>, SourceError>;

    fn find_one(
        &self,
        collection: &str,
        id: &ObjectId,
    ) -> Result<Option<SourceDocument>, SourceError> {
        Ok(self
            .find(collection, &Filter::by_id(id))?
            .into_iter()
            .next())
    }

    fn count(&self, collection: &str, filter: &Filter) -> Result<usize, SourceError> {
        Ok(self.find(collection, filter)?.len())
    }
}

/// Collections held in memory, typically loaded from `mongoexport` dumps.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    collections: BTreeMap<String, Vec<SourceDocument>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection(mut self, name: &str, docs: Vec<SourceDocument>) -> Self {
        self.insert_collection(name, docs);
        self
    }

    pub fn insert_collection(&mut self, name: &str, docs: Vec<SourceDocument>) {
        self.collections.insert(name.to_string(), docs);
    }

    /// Build a collection from raw JSON values.
    pub fn with_json(self, name: &str, values: Vec<Value>) -> Result<Self, SourceError> {
        let docs = values
            .into_iter()
            .map(SourceDocument::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_collection(name, docs))
    }

    /// Load every `<collection>.json` (array) and `<collection>.jsonl`
    /// (one document per line) file directly inside `dir`.
    pub fn from_dump_dir(dir: &Path) -> Result<Self, SourceError> {
        if !dir.is_dir() {
            return Err(SourceError::NotADirectory(dir.to_path_buf()));
        }

        let mut source = Self::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| SourceError::Io(e.into()))?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let docs = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => load_json_array(path)?,
                Some("jsonl") => load_json_lines(path)?,
                _ => continue,
            };
            tracing::debug!(
                collection = stem,
                documents = docs.len(),
                path = %path.display(),
                "loaded collection dump"
            );
            source.insert_collection(stem, docs);
        }
        Ok(source)
    }
}

fn load_json_array(path: &Path) -> Result<Vec<SourceDocument>, SourceError> {
    let contents = fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&contents)?;
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, v)| {
                SourceDocument::from_value(v).map_err(|e| e.at(path, i + 1))
            })
            .collect(),
        other => Ok(vec![SourceDocument::from_value(other).map_err(|e| e.at(path, 1))?]),
    }
}

fn load_json_lines(path: &Path) -> Result<Vec<SourceDocument>, SourceError> {
    let contents = fs::read_to_string(path)?;
    let mut docs = Vec::new();
    for (i, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line)?;
        docs.push(SourceDocument::from_value(value).map_err(|e| e.at(path, i + 1))?);
    }
    Ok(docs)
}

impl SourceStore for MemorySource {
    fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    fn find(&self, collection: &str, filter: &Filter) -> Result<Vec<SourceDocument>, SourceError> {
        let docs = self
            .collections
            .get(collection)
            .ok_or_else(|| SourceError::UnknownCollection(collection.to_string()))?;
        Ok(docs.iter().filter(|d| filter.matches(d)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> MemorySource {
        MemorySource::new()
            .with_json(
                "coursenews",
                vec![
                    json!({"_id": "6733728d9c906b85f3705d5e", "isActive": true, "teacher": {"$oid": "5f1a2b3c4d5e6f7a8b9c0d1e"}}),
                    json!({"_id": "6733728d9c906b85f3705d5f", "isActive": false}),
                ],
            )
            .unwrap()
    }

    #[test]
    fn test_filter_equality() {
        let src = source();
        assert_eq!(src.find("coursenews", &Filter::all()).unwrap().len(), 2);
        assert_eq!(
            src.count("coursenews", &Filter::eq("isActive", true)).unwrap(),
            1
        );
    }

    #[test]
    fn test_filter_matches_extended_object_ids() {
        let src = source();
        let hits = src
            .find("coursenews", &Filter::eq("teacher", "5f1a2b3c4d5e6f7a8b9c0d1e"))
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_find_one_by_id() {
        let src = source();
        let id = ObjectId::parse_str("6733728d9c906b85f3705d5f").unwrap();
        let doc = src.find_one("coursenews", &id).unwrap().unwrap();
        assert_eq!(doc.id(), id);
    }

    #[test]
    fn test_unknown_collection_is_an_error() {
        let src = source();
        assert!(matches!(
            src.find("nope", &Filter::all()),
            Err(SourceError::UnknownCollection(_))
        ));
    }
}
