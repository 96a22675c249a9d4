//! Run configuration: defaults, then an optional JSON file, then the
//! environment, then command-line overrides.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SOURCE_DIR_ENV: &str = "DOCBRIDGE_SOURCE_DIR";
pub const TARGET_DB_ENV: &str = "DOCBRIDGE_TARGET_DB";
pub const MAPPING_FILE_ENV: &str = "DOCBRIDGE_MAPPING_FILE";
pub const BATCH_SIZE_ENV: &str = "DOCBRIDGE_BATCH_SIZE";
pub const REPORT_DIR_ENV: &str = "DOCBRIDGE_REPORT_DIR";
pub const NEAREST_DATE_ENV: &str = "DOCBRIDGE_NEAREST_DATE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory of collection dumps (`<collection>.json` / `.jsonl`)
    pub source_dir: Option<PathBuf>,
    /// SQLite database holding the relational schema
    pub target_db: Option<PathBuf>,
    /// Identifier mapping snapshot
    pub mapping_path: PathBuf,
    /// Documents between two mapping snapshots
    pub batch_size: usize,
    /// Where verification reports are written
    pub report_dir: PathBuf,
    /// Link behaviors to the nearest-dated course when nothing else matches
    pub nearest_date_fallback: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_dir: None,
            target_db: None,
            mapping_path: PathBuf::from("./mongo_to_target_ids.json"),
            batch_size: 100,
            report_dir: PathBuf::from("./reports"),
            nearest_date_fallback: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),
    #[error("invalid `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl MigrationConfig {
    /// Read a JSON config file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, overlaid with `file` when given, then the process
    /// environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Overlay `DOCBRIDGE_*` variables read through `lookup`.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = lookup(SOURCE_DIR_ENV) {
            self.source_dir = Some(PathBuf::from(dir));
        }
        if let Some(db) = lookup(TARGET_DB_ENV) {
            self.target_db = Some(PathBuf::from(db));
        }
        if let Some(path) = lookup(MAPPING_FILE_ENV) {
            self.mapping_path = PathBuf::from(path);
        }
        if let Some(dir) = lookup(REPORT_DIR_ENV) {
            self.report_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(BATCH_SIZE_ENV) {
            self.batch_size = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                key: BATCH_SIZE_ENV,
                reason: format!("`{raw}`: {e}"),
            })?;
        }
        if let Some(raw) = lookup(NEAREST_DATE_ENV) {
            self.nearest_date_fallback = parse_flag(&raw).ok_or_else(|| ConfigError::Invalid {
                key: NEAREST_DATE_ENV,
                reason: format!("`{raw}` is not a boolean"),
            })?;
        }
        Ok(self)
    }

    /// Fails before any work is done when a store location is missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source_dir()?;
        self.target_db()?;
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn source_dir(&self) -> Result<&Path, ConfigError> {
        self.source_dir
            .as_deref()
            .ok_or(ConfigError::Missing("source directory (--source-dir or DOCBRIDGE_SOURCE_DIR)"))
    }

    pub fn target_db(&self) -> Result<&Path, ConfigError> {
        self.target_db
            .as_deref()
            .ok_or(ConfigError::Missing("target database (--target-db or DOCBRIDGE_TARGET_DB)"))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("docbridge.json");
        fs::write(&file, r#"{"source_dir": "/dumps", "batch_size": 50}"#).unwrap();

        let config = MigrationConfig::from_file(&file)
            .unwrap()
            .with_env(env(&[(TARGET_DB_ENV, "/tmp/target.db"), (BATCH_SIZE_ENV, "25")]))
            .unwrap();
        assert_eq!(config.source_dir.as_deref(), Some(Path::new("/dumps")));
        assert_eq!(config.target_db.as_deref(), Some(Path::new("/tmp/target.db")));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.mapping_path, PathBuf::from("./mongo_to_target_ids.json"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_locations_are_fatal() {
        let config = MigrationConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Missing(_))));

        let config = MigrationConfig {
            source_dir: Some("/dumps".into()),
            target_db: Some("t.db".into()),
            batch_size: 0,
            ..MigrationConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { key: "batch_size", .. })));
    }

    #[test]
    fn test_bad_environment_values() {
        let err = MigrationConfig::default()
            .with_env(env(&[(BATCH_SIZE_ENV, "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: BATCH_SIZE_ENV, .. }));

        let config = MigrationConfig::default()
            .with_env(env(&[(NEAREST_DATE_ENV, "off")]))
            .unwrap();
        assert!(!config.nearest_date_fallback);
    }
}
