//! Identifier Translator: the durable source-id → target-key mapping.
//!
//! ```text
//!   transformers ──resolve──►┌──────────────────────┐◄──register── writer
//!                            │ IdentifierTranslator │
//!   resolver ─────resolve───►└──────────┬───────────┘
//!                                       │ persist (after every batch)
//!                                       ▼
//!                     mongo_to_target_ids.json (lookup key → entry)
//! ```
//!
//! Two invariants hold at all times:
//! - a source id maps to at most one target key
//! - a target key is never shared by two source ids
//!
//! The snapshot is written atomically (temporary file, then rename) so an
//! interrupted run never leaves a truncated mapping behind.

use docbridge_source::ObjectId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::family::EntityKind;

// ============================================================================
// Types
// ============================================================================

/// One persisted mapping entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    #[serde(alias = "mongo_id")]
    pub source_id: ObjectId,
    #[serde(alias = "supabase_id")]
    pub target_key: Uuid,
    #[serde(default)]
    pub kind: EntityKind,
    /// For human lookup only.
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Whole-mapping snapshot, keyed by a human-readable lookup key.
pub type MappingSnapshot = BTreeMap<String, MappingEntry>;

/// Descriptive fields attached to a registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub kind: EntityKind,
    pub display_name: String,
    pub extra: BTreeMap<String, Value>,
}

impl Descriptor {
    pub fn new(kind: EntityKind, display_name: impl Into<String>) -> Self {
        Self {
            kind,
            display_name: display_name.into(),
            extra: BTreeMap::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranslatorError {
    #[error("source id {source_id} is already mapped to {existing}, refusing {attempted}")]
    DuplicateMapping {
        source_id: ObjectId,
        existing: Uuid,
        attempted: Uuid,
    },
    #[error("target key {target_key} already belongs to {existing_source}, refusing {attempted_source}")]
    TargetKeyReused {
        target_key: Uuid,
        existing_source: ObjectId,
        attempted_source: ObjectId,
    },
    #[error("no mapping for source id {0}")]
    NotFound(ObjectId),
    #[error("mapping file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("mapping file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// Translator
// ============================================================================

#[derive(Debug, Default)]
pub struct IdentifierTranslator {
    path: Option<PathBuf>,
    by_source: HashMap<ObjectId, MappingEntry>,
    by_target: HashMap<Uuid, ObjectId>,
    dirty: bool,
}

impl IdentifierTranslator {
    /// In-memory translator with no backing file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path`, or start empty when it does not exist.
    /// [`persist`](Self::persist) writes back to the same path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TranslatorError> {
        let path = path.into();
        let mut translator = Self {
            path: Some(path.clone()),
            ..Self::default()
        };
        if path.exists() {
            let contents = fs::read_to_string(&path).map_err(|source| TranslatorError::Io {
                path: path.clone(),
                source,
            })?;
            let snapshot: MappingSnapshot =
                serde_json::from_str(&contents).map_err(|source| TranslatorError::Json {
                    path: path.clone(),
                    source,
                })?;
            translator.bulk_import(snapshot)?;
            translator.dirty = false;
            tracing::info!(
                path = %path.display(),
                entries = translator.len(),
                "identifier mapping loaded"
            );
        }
        Ok(translator)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.by_source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source.is_empty()
    }

    /// Whether registrations happened since the last load or persist.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Validate a registration without performing it.
    pub fn check_register(&self, source_id: ObjectId, target_key: Uuid) -> Result<(), TranslatorError> {
        if let Some(existing) = self.by_source.get(&source_id) {
            if existing.target_key != target_key {
                return Err(TranslatorError::DuplicateMapping {
                    source_id,
                    existing: existing.target_key,
                    attempted: target_key,
                });
            }
            return Ok(());
        }
        if let Some(owner) = self.by_target.get(&target_key) {
            if *owner != source_id {
                return Err(TranslatorError::TargetKeyReused {
                    target_key,
                    existing_source: *owner,
                    attempted_source: source_id,
                });
            }
        }
        Ok(())
    }

    /// Record `source_id → target_key`. Registering the same pair again is a
    /// no-op; returns whether a new entry was added.
    pub fn register(
        &mut self,
        source_id: ObjectId,
        target_key: Uuid,
        descriptor: Descriptor,
    ) -> Result<bool, TranslatorError> {
        self.check_register(source_id, target_key)?;
        if self.by_source.contains_key(&source_id) {
            return Ok(false);
        }
        self.by_source.insert(
            source_id,
            MappingEntry {
                source_id,
                target_key,
                kind: descriptor.kind,
                display_name: descriptor.display_name,
                extra: descriptor.extra,
            },
        );
        self.by_target.insert(target_key, source_id);
        self.dirty = true;
        Ok(true)
    }

    pub fn resolve(&self, source_id: ObjectId) -> Option<Uuid> {
        self.by_source.get(&source_id).map(|e| e.target_key)
    }

    /// Like [`resolve`](Self::resolve), but only for entries of `kind`.
    pub fn resolve_kind(&self, source_id: ObjectId, kind: EntityKind) -> Option<Uuid> {
        self.by_source
            .get(&source_id)
            .filter(|e| e.kind == kind)
            .map(|e| e.target_key)
    }

    pub fn require(&self, source_id: ObjectId) -> Result<Uuid, TranslatorError> {
        self.resolve(source_id)
            .ok_or(TranslatorError::NotFound(source_id))
    }

    pub fn descriptor(&self, source_id: ObjectId) -> Option<&MappingEntry> {
        self.by_source.get(&source_id)
    }

    pub fn source_of(&self, target_key: Uuid) -> Option<ObjectId> {
        self.by_target.get(&target_key).copied()
    }

    pub fn count_kind(&self, kind: EntityKind) -> usize {
        self.by_source.values().filter(|e| e.kind == kind).count()
    }

    // ------------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------------

    pub fn bulk_export(&self) -> MappingSnapshot {
        let mut entries: Vec<&MappingEntry> = self.by_source.values().collect();
        entries.sort_by_key(|e| e.source_id);

        let mut snapshot = MappingSnapshot::new();
        for entry in entries {
            let mut key = lookup_key(entry, false);
            if snapshot.contains_key(&key) {
                key = lookup_key(entry, true);
            }
            snapshot.insert(key, entry.clone());
        }
        snapshot
    }

    /// Merge a snapshot. Entries already present with the same key are
    /// skipped; conflicting entries abort the import. Returns the number of
    /// entries added.
    pub fn bulk_import(&mut self, snapshot: MappingSnapshot) -> Result<usize, TranslatorError> {
        for entry in snapshot.values() {
            self.check_register(entry.source_id, entry.target_key)?;
        }
        let mut added = 0;
        for entry in snapshot.into_values() {
            let descriptor = Descriptor {
                kind: entry.kind,
                display_name: entry.display_name,
                extra: entry.extra,
            };
            if self.register(entry.source_id, entry.target_key, descriptor)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Write the snapshot to the backing file, if any.
    pub fn persist(&mut self) -> Result<(), TranslatorError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.persist_to(&path)?;
        self.dirty = false;
        Ok(())
    }

    /// Atomically write the snapshot to `path`.
    pub fn persist_to(&self, path: &Path) -> Result<(), TranslatorError> {
        let io_err = |source| TranslatorError::Io {
            path: path.to_path_buf(),
            source,
        };
        let json = serde_json::to_string_pretty(&self.bulk_export()).map_err(|source| {
            TranslatorError::Json {
                path: path.to_path_buf(),
                source,
            }
        })?;

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;

        tracing::debug!(path = %path.display(), entries = self.len(), "identifier mapping persisted");
        Ok(())
    }
}

fn lookup_key(entry: &MappingEntry, full: bool) -> String {
    let suffix = if full {
        entry.source_id.to_string()
    } else {
        entry.source_id.short(6)
    };
    format!("{}:{}:{}", entry.kind, slug(&entry.display_name), suffix)
}

fn slug(name: &str) -> String {
    let mut out = String::new();
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            out.push(c);
        } else if !out.ends_with('-') && !out.is_empty() {
            out.push('-');
        }
    }
    let trimmed = out.trim_end_matches('-');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(s: &str) -> ObjectId {
        ObjectId::parse_str(s).unwrap()
    }

    #[test]
    fn test_register_is_idempotent_for_same_key() {
        let mut t = IdentifierTranslator::new();
        let id = oid("6733728d9c906b85f3705d5e");
        let key = Uuid::new_v4();
        assert!(t.register(id, key, Descriptor::new(EntityKind::User, "Amina K")).unwrap());
        assert!(!t.register(id, key, Descriptor::new(EntityKind::User, "Amina K")).unwrap());
        assert_eq!(t.resolve(id), Some(key));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_conflicting_registrations_are_rejected() {
        let mut t = IdentifierTranslator::new();
        let a = oid("6733728d9c906b85f3705d5e");
        let b = oid("6733728d9c906b85f3705d5f");
        let key = Uuid::new_v4();
        t.register(a, key, Descriptor::new(EntityKind::User, "a")).unwrap();

        assert!(matches!(
            t.register(a, Uuid::new_v4(), Descriptor::new(EntityKind::User, "a")),
            Err(TranslatorError::DuplicateMapping { .. })
        ));
        assert!(matches!(
            t.register(b, key, Descriptor::new(EntityKind::User, "b")),
            Err(TranslatorError::TargetKeyReused { .. })
        ));
        assert!(matches!(t.require(b), Err(TranslatorError::NotFound(_))));
    }

    #[test]
    fn test_lookup_keys() {
        let mut t = IdentifierTranslator::new();
        t.register(
            oid("6733728d9c906b85f3705d5e"),
            Uuid::new_v4(),
            Descriptor::new(EntityKind::User, "Amina  Kaci!"),
        )
        .unwrap();
        // Same name and same trailing hex: the second entry gets the full id.
        t.register(
            oid("6633728d9c906b85f3705d5e"),
            Uuid::new_v4(),
            Descriptor::new(EntityKind::User, "amina kaci"),
        )
        .unwrap();

        let keys: Vec<_> = t.bulk_export().into_keys().collect();
        assert!(keys.contains(&"user:amina-kaci:705d5e".to_string()));
        assert!(keys.contains(&"user:amina-kaci:6733728d9c906b85f3705d5e".to_string()));
    }

    #[test]
    fn test_persist_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ids.json");
        let id = oid("6733728d9c906b85f3705d5e");
        let key = Uuid::new_v4();

        let mut t = IdentifierTranslator::open(&path).unwrap();
        assert!(t.is_empty());
        t.register(id, key, Descriptor::new(EntityKind::Session, "arabic 3").with_extra("level", 3))
            .unwrap();
        assert!(t.is_dirty());
        t.persist().unwrap();
        assert!(!t.is_dirty());

        let reopened = IdentifierTranslator::open(&path).unwrap();
        assert_eq!(reopened.resolve(id), Some(key));
        let entry = reopened.descriptor(id).unwrap();
        assert_eq!(entry.kind, EntityKind::Session);
        assert_eq!(entry.extra.get("level"), Some(&Value::from(3)));
    }

    #[test]
    fn test_legacy_field_names_are_accepted() {
        let key = Uuid::new_v4();
        let json = format!(
            r#"{{"amina_kaci": {{"mongo_id": "6733728d9c906b85f3705d5e", "supabase_id": "{key}", "firstname": "Amina"}}}}"#
        );
        let snapshot: MappingSnapshot = serde_json::from_str(&json).unwrap();
        let mut t = IdentifierTranslator::new();
        assert_eq!(t.bulk_import(snapshot).unwrap(), 1);
        let entry = t.descriptor(oid("6733728d9c906b85f3705d5e")).unwrap();
        assert_eq!(entry.target_key, key);
        assert_eq!(entry.kind, EntityKind::User);
        assert_eq!(entry.extra.get("firstname"), Some(&Value::from("Amina")));
    }
}
