//! Server-side versioned record storage.
//!
//! Records are stored per family, one JSON file per entity type:
//! ```text
//! <DATA_DIR>/
//!   <family_id>/
//!     task.json
//!     redemption.json
//!     ...
//! ```
//!
//! Each record carries a server-managed `version` that increases on every
//! write. A write based on a stale version is rejected with the current
//! record unless it is forced. Callers serialize writers; the storage itself
//! only guarantees that each file is replaced atomically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;

/// Entity type whose records may never be overwritten once created.
const APPEND_ONLY_ENTITY: &str = "redemption";

/// One stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub version: u64,
    /// Server time of the last write, used for `since` queries.
    pub modified_at: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl StoredRecord {
    /// Client-facing view: the data plus `version`, and `updated_at` when the
    /// client did not supply one.
    pub fn to_json(&self) -> Value {
        let mut data = self.data.clone();
        data.insert("version".to_string(), Value::from(self.version));
        data.entry("updated_at")
            .or_insert_with(|| Value::String(self.modified_at.to_rfc3339()));
        Value::Object(data)
    }
}

type Collection = BTreeMap<String, StoredRecord>;

/// Errors that can occur during server storage operations.
#[derive(Debug)]
pub enum RecordStorageError {
    /// I/O error reading or writing a file.
    IoError(PathBuf, io::Error),
    /// A collection file could not be parsed.
    CorruptCollection(PathBuf, serde_json::Error),
    /// Invalid family ID (e.g., contains path separators).
    InvalidFamilyId(String),
    /// Invalid entity type name.
    InvalidEntity(String),
    /// The record body does not fit the request.
    InvalidRecord(String),
    /// The write was based on a stale version, or would overwrite an
    /// existing record. Carries the current record.
    Conflict(Box<StoredRecord>),
}

impl std::fmt::Display for RecordStorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordStorageError::IoError(path, e) => {
                write!(f, "I/O error for {}: {}", path.display(), e)
            }
            RecordStorageError::CorruptCollection(path, e) => {
                write!(f, "Failed to parse {}: {}", path.display(), e)
            }
            RecordStorageError::InvalidFamilyId(id) => write!(f, "Invalid family ID: {}", id),
            RecordStorageError::InvalidEntity(e) => write!(f, "Invalid entity type: {}", e),
            RecordStorageError::InvalidRecord(msg) => write!(f, "Invalid record: {}", msg),
            RecordStorageError::Conflict(current) => {
                write!(f, "Version conflict (current version {})", current.version)
            }
        }
    }
}

impl std::error::Error for RecordStorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordStorageError::IoError(_, e) => Some(e),
            RecordStorageError::CorruptCollection(_, e) => Some(e),
            _ => None,
        }
    }
}

/// File-backed record storage.
#[derive(Debug, Clone)]
pub struct RecordStorage {
    data_dir: PathBuf,
}

impl RecordStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Validates a family ID to prevent path traversal attacks.
    fn validate_family_id(family_id: &str) -> Result<(), RecordStorageError> {
        if family_id.is_empty()
            || family_id.contains('/')
            || family_id.contains('\\')
            || family_id.contains("..")
            || family_id.starts_with('.')
        {
            return Err(RecordStorageError::InvalidFamilyId(family_id.to_string()));
        }
        Ok(())
    }

    fn validate_entity(entity: &str) -> Result<(), RecordStorageError> {
        let valid = !entity.is_empty()
            && entity
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
        if !valid {
            return Err(RecordStorageError::InvalidEntity(entity.to_string()));
        }
        Ok(())
    }

    fn collection_path(&self, family_id: &str, entity: &str) -> PathBuf {
        self.data_dir
            .join(family_id)
            .join(format!("{}.json", entity))
    }

    fn load(&self, family_id: &str, entity: &str) -> Result<Collection, RecordStorageError> {
        Self::validate_family_id(family_id)?;
        Self::validate_entity(entity)?;

        let path = self.collection_path(family_id, entity);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| RecordStorageError::CorruptCollection(path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Collection::new()),
            Err(e) => Err(RecordStorageError::IoError(path, e)),
        }
    }

    fn save(
        &self,
        family_id: &str,
        entity: &str,
        collection: &Collection,
    ) -> Result<(), RecordStorageError> {
        let family_dir = self.data_dir.join(family_id);
        let path = self.collection_path(family_id, entity);

        fs::create_dir_all(&family_dir)
            .map_err(|e| RecordStorageError::IoError(family_dir.clone(), e))?;

        let bytes = serde_json::to_vec_pretty(collection)
            .map_err(|e| RecordStorageError::CorruptCollection(path.clone(), e))?;

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, bytes)
            .map_err(|e| RecordStorageError::IoError(temp_path.clone(), e))?;
        fs::rename(&temp_path, &path).map_err(|e| RecordStorageError::IoError(path, e))?;

        Ok(())
    }

    /// Records of one entity type, optionally only those written after `since`.
    pub fn list(
        &self,
        family_id: &str,
        entity: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<StoredRecord>, RecordStorageError> {
        let collection = self.load(family_id, entity)?;
        Ok(collection
            .into_values()
            .filter(|r| since.map_or(true, |t| r.modified_at > t))
            .collect())
    }

    pub fn get(
        &self,
        family_id: &str,
        entity: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, RecordStorageError> {
        Ok(self.load(family_id, entity)?.remove(id))
    }

    /// Creates a record. An existing id is a conflict unless forced, and is
    /// always a conflict for append-only entities.
    pub fn insert(
        &self,
        family_id: &str,
        entity: &str,
        id: &str,
        data: Map<String, Value>,
        force: bool,
    ) -> Result<StoredRecord, RecordStorageError> {
        let mut collection = self.load(family_id, entity)?;
        let data = normalize(id, data)?;

        let version = match collection.get(id) {
            Some(existing) if !force || entity == APPEND_ONLY_ENTITY => {
                return Err(RecordStorageError::Conflict(Box::new(existing.clone())));
            }
            Some(existing) => existing.version + 1,
            None => 1,
        };

        let record = StoredRecord {
            version,
            modified_at: Utc::now(),
            data,
        };
        collection.insert(id.to_string(), record.clone());
        self.save(family_id, entity, &collection)?;
        Ok(record)
    }

    /// Updates (or creates) a record. A body `version` that differs from the
    /// stored one is a conflict unless forced.
    pub fn update(
        &self,
        family_id: &str,
        entity: &str,
        id: &str,
        data: Map<String, Value>,
        force: bool,
    ) -> Result<StoredRecord, RecordStorageError> {
        let mut collection = self.load(family_id, entity)?;
        let base_version = data.get("version").and_then(Value::as_u64);
        let data = normalize(id, data)?;

        let version = match collection.get(id) {
            Some(existing) if entity == APPEND_ONLY_ENTITY => {
                return Err(RecordStorageError::Conflict(Box::new(existing.clone())));
            }
            Some(existing) => {
                if !force && base_version.is_some_and(|v| v != existing.version) {
                    return Err(RecordStorageError::Conflict(Box::new(existing.clone())));
                }
                existing.version + 1
            }
            None => 1,
        };

        let record = StoredRecord {
            version,
            modified_at: Utc::now(),
            data,
        };
        collection.insert(id.to_string(), record.clone());
        self.save(family_id, entity, &collection)?;
        Ok(record)
    }

    /// Removes a record. Returns whether it existed.
    pub fn delete(&self, family_id: &str, entity: &str, id: &str) -> Result<bool, RecordStorageError> {
        let mut collection = self.load(family_id, entity)?;
        if collection.remove(id).is_none() {
            return Ok(false);
        }
        self.save(family_id, entity, &collection)?;
        Ok(true)
    }
}

/// Strips the server-managed `version` and checks the body id against the path.
fn normalize(id: &str, mut data: Map<String, Value>) -> Result<Map<String, Value>, RecordStorageError> {
    data.remove("version");
    match data.get("id") {
        None => {
            data.insert("id".to_string(), Value::String(id.to_string()));
        }
        Some(Value::String(body_id)) if body_id == id => {}
        Some(Value::Number(n)) if n.to_string() == id => {}
        Some(other) => {
            return Err(RecordStorageError::InvalidRecord(format!(
                "body id {} does not match path id '{}'",
                other, id
            )));
        }
    }
    Ok(data)
}
