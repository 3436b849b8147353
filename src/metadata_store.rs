//! C2 — Metadata store: persistent mapping from file identity to ingestion
//! records, keyed by `file_id`. Grounded on the file-backed JSON persistence
//! pattern already used by `memory::MemorySystem`.

use crate::errors::{RagError, RagResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// §3 "File ingestion record".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileIngestionRecord {
    pub file_id: String,
    pub file_path: String,
    pub file_size: u64,
    pub file_type: String,
    pub ingested_at: DateTime<Utc>,
    pub chunk_count: usize,
    pub vector_ids: Vec<i64>,
    pub user_metadata: serde_json::Map<String, serde_json::Value>,
    /// Set when a later ingest supersedes this record's vectors.
    pub superseded: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreContents {
    records: HashMap<String, FileIngestionRecord>,
}

pub struct FileMetadataStore {
    path: PathBuf,
    inner: RwLock<StoreContents>,
}

impl FileMetadataStore {
    /// Open (or create) the metadata store rooted at `metadata/files.json`
    /// under `data_dir`, per the persisted state layout.
    pub fn open(data_dir: &Path) -> RagResult<Self> {
        let dir = data_dir.join("metadata");
        std::fs::create_dir_all(&dir)
            .map_err(|e| RagError::storage(format!("failed to create metadata dir: {e}")))?;
        let path = dir.join("files.json");

        let inner = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| RagError::storage(format!("failed to read metadata store: {e}")))?;
            serde_json::from_str(&content)
                .map_err(|e| RagError::storage(format!("corrupt metadata store: {e}")))?
        } else {
            StoreContents::default()
        };

        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    /// Insert or supersede the record for a given document identity. Any
    /// existing, non-superseded record with the same `file_path` is marked
    /// superseded (not deleted), matching the lifecycle in §3.
    pub fn put(&self, mut record: FileIngestionRecord) -> RagResult<String> {
        if record.file_id.is_empty() {
            record.file_id = Uuid::new_v4().to_string();
        }
        let file_id = record.file_id.clone();

        {
            let mut guard = self.inner.write();
            for existing in guard.records.values_mut() {
                if existing.file_path == record.file_path && !existing.superseded {
                    existing.superseded = true;
                }
            }
            guard.records.insert(file_id.clone(), record);
        }
        self.persist()?;
        Ok(file_id)
    }

    pub fn get(&self, file_id: &str) -> Option<FileIngestionRecord> {
        self.inner.read().records.get(file_id).cloned()
    }

    /// The live (non-superseded) record for a file path, if any.
    pub fn active_for_path(&self, file_path: &str) -> Option<FileIngestionRecord> {
        self.inner
            .read()
            .records
            .values()
            .find(|r| r.file_path == file_path && !r.superseded)
            .cloned()
    }

    pub fn list_active(&self) -> Vec<FileIngestionRecord> {
        self.inner
            .read()
            .records
            .values()
            .filter(|r| !r.superseded)
            .cloned()
            .collect()
    }

    pub fn remove(&self, file_id: &str) -> RagResult<()> {
        self.inner.write().records.remove(file_id);
        self.persist()
    }

    /// Removes every record. Used by the "delete everything" HTTP endpoint.
    pub fn clear(&self) -> RagResult<usize> {
        let removed = {
            let mut guard = self.inner.write();
            let count = guard.records.len();
            guard.records.clear();
            count
        };
        self.persist()?;
        Ok(removed)
    }

    /// Write-to-temp-then-rename for atomicity.
    fn persist(&self) -> RagResult<()> {
        let snapshot = serde_json::to_string_pretty(&*self.inner.read())
            .map_err(|e| RagError::storage(format!("failed to serialize metadata store: {e}")))?;
        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, snapshot)
            .map_err(|e| RagError::storage(format!("failed to write metadata store: {e}")))?;
        std::fs::rename(&tmp_path, &self.path)
            .map_err(|e| RagError::storage(format!("failed to rename metadata store: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(path: &str) -> FileIngestionRecord {
        FileIngestionRecord {
            file_id: String::new(),
            file_path: path.to_string(),
            file_size: 10,
            file_type: "txt".to_string(),
            ingested_at: Utc::now(),
            chunk_count: 1,
            vector_ids: vec![1],
            user_metadata: serde_json::Map::new(),
            superseded: false,
        }
    }

    #[test]
    fn put_supersedes_previous_record_for_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::open(dir.path()).unwrap();

        let id1 = store.put(sample_record("/geo/paris")).unwrap();
        let id2 = store.put(sample_record("/geo/paris")).unwrap();

        assert_ne!(id1, id2);
        assert!(store.get(&id1).unwrap().superseded);
        assert!(!store.get(&id2).unwrap().superseded);
        assert_eq!(store.active_for_path("/geo/paris").unwrap().file_id, id2);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileMetadataStore::open(dir.path()).unwrap();
            store.put(sample_record("/a")).unwrap();
        }
        let store2 = FileMetadataStore::open(dir.path()).unwrap();
        assert_eq!(store2.list_active().len(), 1);
    }

    #[test]
    fn clear_removes_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileMetadataStore::open(dir.path()).unwrap();
        store.put(sample_record("/a")).unwrap();
        store.put(sample_record("/b")).unwrap();
        let removed = store.clear().unwrap();
        assert_eq!(removed, 2);
        assert!(store.list_active().is_empty());
    }
}
