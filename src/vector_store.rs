//! C3 — Vector store: dense index plus per-vector metadata, with soft
//! delete, update-in-place, and crash-safe persistence.
//!
//! The dense vectors themselves are kept in memory for exact, deterministic
//! cosine scoring and tie-breaking (§4.1's ordering guarantees), and mirrored
//! to disk through the teacher's `storage::LanceStore` (LanceDB-backed) for
//! `vectors/index.lance`; `vectors/sidecar.json` holds the
//! `vector_id -> metadata` map (including the `deleted` flag) with
//! write-to-temp-then-rename atomicity, per the persisted state layout.

use crate::errors::{RagError, RagResult};
use crate::storage::lance_store::LanceStore;
use crate::types::ChunkRecord;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};

pub const RESERVED_KEYS: &[&str] = &[
    "text",
    "doc_id",
    "doc_path",
    "filename",
    "chunk_index",
    "source_type",
    "ingested_at",
    "deleted",
];

#[derive(Debug, Clone)]
struct VectorEntry {
    vector: Vec<f32>,
    metadata: Map<String, Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResult {
    pub id: i64,
    pub score: f32,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SearchResultWithMetadata {
    pub id: i64,
    pub score: f32,
    pub text: String,
    pub doc_id: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VectorStoreStats {
    pub total_vectors: usize,
    pub active_vectors: usize,
    pub dimension: usize,
    pub index_type: String,
}

/// Flattens a nested `{metadata: {...}}` field into the top level, per the
/// registry invariant (§9 "Metadata flattening"). Idempotent.
pub fn flatten_metadata(mut metadata: Map<String, Value>) -> Map<String, Value> {
    if let Some(Value::Object(nested)) = metadata.remove("metadata") {
        for (k, v) in nested {
            metadata.entry(k).or_insert(v);
        }
    }
    metadata
}

pub struct VectorStore {
    dimension: usize,
    data_dir: PathBuf,
    next_id: AtomicI64,
    entries: RwLock<HashMap<i64, VectorEntry>>,
    lance: LanceStore,
}

impl VectorStore {
    pub async fn open(data_dir: &Path, dimension: usize) -> RagResult<Self> {
        let vectors_dir = data_dir.join("vectors");
        std::fs::create_dir_all(&vectors_dir)
            .map_err(|e| RagError::storage(format!("failed to create vectors dir: {e}")))?;

        let lance = LanceStore::new(
            vectors_dir.join("index.lance").to_string_lossy().as_ref(),
            dimension,
        )
        .await
        .map_err(|e| RagError::storage(format!("failed to open vector index: {e}")))?;

        let store = Self {
            dimension,
            data_dir: data_dir.to_path_buf(),
            next_id: AtomicI64::new(0),
            entries: RwLock::new(HashMap::new()),
            lance,
        };

        store.load().await?;
        Ok(store)
    }

    fn sidecar_path(&self) -> PathBuf {
        self.data_dir.join("vectors").join("sidecar.json")
    }

    /// `add_vectors` — appends vectors, assigns fresh monotonic ids, stores
    /// metadata verbatim (with `deleted=false`, `added_at` stamped).
    /// All-or-nothing: a dimension mismatch anywhere in the batch fails the
    /// whole call before any vector is added.
    pub async fn add_vectors(
        &self,
        vectors: Vec<Vec<f32>>,
        metas: Vec<Map<String, Value>>,
    ) -> RagResult<Vec<i64>> {
        if vectors.len() != metas.len() {
            return Err(RagError::storage("vectors and metadata length mismatch"));
        }
        for v in &vectors {
            if v.len() != self.dimension {
                return Err(RagError::storage(format!(
                    "dimension mismatch: expected {}, got {}",
                    self.dimension,
                    v.len()
                ))
                .with_details("expected_dim", self.dimension as u64)
                .with_details("actual_dim", v.len() as u64));
            }
        }

        let now = Utc::now();
        let mut ids = Vec::with_capacity(vectors.len());
        let mut chunk_records = Vec::with_capacity(vectors.len());

        {
            let mut guard = self.entries.write();
            for (vector, mut metadata) in vectors.into_iter().zip(metas.into_iter()) {
                metadata = flatten_metadata(metadata);
                metadata.insert("deleted".to_string(), Value::Bool(false));
                metadata
                    .entry("ingested_at".to_string())
                    .or_insert(Value::String(now.to_rfc3339()));
                metadata.insert("added_at".to_string(), Value::String(now.to_rfc3339()));

                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                ids.push(id);

                chunk_records.push(ChunkRecord {
                    id: id.to_string(),
                    doc_id: metadata
                        .get("doc_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    chunk_index: metadata
                        .get("chunk_index")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(0) as u32,
                    text: metadata
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    title: String::new(),
                    source: metadata
                        .get("source_type")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    heading: String::new(),
                    vector: vector.clone(),
                    space_id: String::new(),
                    metadata_json: serde_json::to_string(&metadata).unwrap_or_default(),
                    citation_json: "{}".to_string(),
                    created_at: now.timestamp(),
                });

                guard.insert(id, VectorEntry { vector, metadata });
            }
        }

        self.lance
            .upsert_chunks(chunk_records)
            .await
            .map_err(|e| RagError::storage(format!("failed to persist vectors: {e}")))?;

        Ok(ids)
    }

    /// Cosine similarity search over non-deleted vectors. Ties broken by
    /// lower `vector_id`.
    pub fn search(&self, query: &[f32], k: usize) -> RagResult<Vec<SearchResult>> {
        if query.len() != self.dimension {
            return Err(RagError::storage(format!(
                "query dimension mismatch: expected {}, got {}",
                self.dimension,
                query.len()
            )));
        }
        let guard = self.entries.read();
        let mut scored: Vec<(i64, f32)> = guard
            .iter()
            .filter(|(_, e)| !is_deleted(&e.metadata))
            .map(|(id, e)| (*id, cosine_similarity(query, &e.vector)))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(id, score)| SearchResult { id, score })
            .collect())
    }

    pub fn search_with_metadata(
        &self,
        query: &[f32],
        k: usize,
    ) -> RagResult<Vec<SearchResultWithMetadata>> {
        let hits = self.search(query, k)?;
        let guard = self.entries.read();
        Ok(hits
            .into_iter()
            .filter_map(|h| {
                guard.get(&h.id).map(|e| SearchResultWithMetadata {
                    id: h.id,
                    score: h.score,
                    text: e
                        .metadata
                        .get("text")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    doc_id: e
                        .metadata
                        .get("doc_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    metadata: e.metadata.clone(),
                })
            })
            .collect())
    }

    /// Soft-deletes by setting `metadata.deleted = true`. Idempotent.
    pub fn delete_vectors(&self, ids: &[i64]) -> usize {
        let mut guard = self.entries.write();
        let mut n = 0;
        for id in ids {
            if let Some(entry) = guard.get_mut(id) {
                if !is_deleted(&entry.metadata) {
                    entry.metadata.insert("deleted".to_string(), Value::Bool(true));
                    n += 1;
                }
            }
        }
        n
    }

    /// Shallow-merges `patch` into existing metadata. Cannot un-delete.
    pub fn update_metadata(&self, id: i64, patch: Map<String, Value>) -> RagResult<()> {
        let mut guard = self.entries.write();
        let entry = guard
            .get_mut(&id)
            .ok_or_else(|| RagError::storage(format!("vector {id} not found")))?;

        let was_deleted = is_deleted(&entry.metadata);
        for (k, v) in patch {
            if k == "deleted" && was_deleted && v == Value::Bool(false) {
                continue;
            }
            entry.metadata.insert(k, v);
        }
        Ok(())
    }

    /// Removes every vector and its metadata.
    pub async fn clear_index(&self) -> RagResult<()> {
        self.entries.write().clear();
        self.lance
            .clear()
            .await
            .map_err(|e| RagError::storage(format!("failed to clear index: {e}")))?;
        self.next_id.store(0, Ordering::SeqCst);
        self.persist()?;
        Ok(())
    }

    /// Ids of non-deleted vectors whose metadata `key` equals `value`. Used
    /// by the ingestion engine's replace-on-update identity lookup.
    pub fn find_ids_by_field(&self, key: &str, value: &str) -> Vec<i64> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| !is_deleted(&e.metadata))
            .filter(|(_, e)| e.metadata.get(key).and_then(|v| v.as_str()) == Some(value))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn get_stats(&self) -> VectorStoreStats {
        let guard = self.entries.read();
        let active = guard.values().filter(|e| !is_deleted(&e.metadata)).count();
        VectorStoreStats {
            total_vectors: guard.len(),
            active_vectors: active,
            dimension: self.dimension,
            index_type: "lancedb+in-memory-cosine".to_string(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Serializes the sidecar `vector_id -> metadata` map to disk, atomically.
    pub fn persist(&self) -> RagResult<()> {
        let guard = self.entries.read();
        let serializable: HashMap<String, (Vec<f32>, Map<String, Value>)> = guard
            .iter()
            .map(|(id, e)| (id.to_string(), (e.vector.clone(), e.metadata.clone())))
            .collect();
        drop(guard);

        let payload = serde_json::json!({
            "dimension": self.dimension,
            "next_id": self.next_id.load(Ordering::SeqCst),
            "entries": serializable,
        });

        let dir = self.data_dir.join("vectors");
        std::fs::create_dir_all(&dir)
            .map_err(|e| RagError::storage(format!("failed to create vectors dir: {e}")))?;
        let tmp_path = dir.join("sidecar.json.tmp");
        std::fs::write(
            &tmp_path,
            serde_json::to_string_pretty(&payload)
                .map_err(|e| RagError::storage(format!("failed to serialize sidecar: {e}")))?,
        )
        .map_err(|e| RagError::storage(format!("failed to write sidecar: {e}")))?;
        std::fs::rename(&tmp_path, self.sidecar_path())
            .map_err(|e| RagError::storage(format!("failed to rename sidecar: {e}")))?;
        Ok(())
    }

    /// Loads the sidecar map from disk if present, rejecting a mismatched
    /// dimension. A missing sidecar is not an error (fresh store).
    pub async fn load(&self) -> RagResult<()> {
        let path = self.sidecar_path();
        if !path.exists() {
            return Ok(());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| RagError::storage(format!("failed to read sidecar: {e}")))?;
        let payload: Value = serde_json::from_str(&content)
            .map_err(|e| RagError::storage(format!("corrupt sidecar file: {e}")))?;

        let stored_dim = payload
            .get("dimension")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        if stored_dim != self.dimension {
            return Err(RagError::storage(format!(
                "sidecar dimension {stored_dim} does not match store dimension {}",
                self.dimension
            )));
        }

        let entries: HashMap<String, (Vec<f32>, Map<String, Value>)> = serde_json::from_value(
            payload.get("entries").cloned().unwrap_or(Value::Null),
        )
        .map_err(|e| RagError::storage(format!("corrupt sidecar entries: {e}")))?;

        let mut guard = self.entries.write();
        guard.clear();
        let mut max_id = -1i64;
        for (id_str, (vector, metadata)) in entries {
            let id: i64 = id_str
                .parse()
                .map_err(|_| RagError::storage("corrupt sidecar: non-integer vector id"))?;
            max_id = max_id.max(id);
            guard.insert(id, VectorEntry { vector, metadata });
        }
        drop(guard);

        let next_id = payload
            .get("next_id")
            .and_then(|v| v.as_i64())
            .unwrap_or(max_id + 1);
        self.next_id.store(next_id.max(max_id + 1), Ordering::SeqCst);
        Ok(())
    }
}

fn is_deleted(metadata: &Map<String, Value>) -> bool {
    matches!(metadata.get("deleted"), Some(Value::Bool(true)))
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(text: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("text".to_string(), Value::String(text.to_string()));
        m
    }

    #[tokio::test]
    async fn add_then_search_finds_nearest() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), 3).await.unwrap();

        let ids = store
            .add_vectors(
                vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
                vec![meta("a"), meta("b")],
            )
            .await
            .unwrap();

        let hits = store.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(hits[0].id, ids[0]);
        assert!(hits[0].score > 0.99);
    }

    #[tokio::test]
    async fn delete_hides_from_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), 2).await.unwrap();
        let ids = store
            .add_vectors(vec![vec![1.0, 0.0]], vec![meta("x")])
            .await
            .unwrap();

        let n = store.delete_vectors(&ids);
        assert_eq!(n, 1);
        assert_eq!(store.delete_vectors(&ids), 0, "delete is idempotent");

        let hits = store.search(&[1.0, 0.0], 10).unwrap();
        assert!(hits.is_empty());
        assert_eq!(store.get_stats().active_vectors, 0);
    }

    #[tokio::test]
    async fn dimension_mismatch_fails_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), 3).await.unwrap();
        let result = store
            .add_vectors(vec![vec![1.0, 0.0, 0.0], vec![1.0, 0.0]], vec![meta("a"), meta("b")])
            .await;
        assert!(result.is_err());
        assert_eq!(store.get_stats().total_vectors, 0);
    }

    #[tokio::test]
    async fn clear_index_empties_everything() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), 2).await.unwrap();
        store
            .add_vectors(vec![vec![1.0, 0.0]], vec![meta("x")])
            .await
            .unwrap();
        store.clear_index().await.unwrap();
        assert_eq!(store.get_stats().total_vectors, 0);
        assert!(store.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_index_persists_so_reopen_stays_empty() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = VectorStore::open(dir.path(), 2).await.unwrap();
            store
                .add_vectors(vec![vec![1.0, 0.0]], vec![meta("x")])
                .await
                .unwrap();
            store.persist().unwrap();
            store.clear_index().await.unwrap();
        }

        let reopened = VectorStore::open(dir.path(), 2).await.unwrap();
        assert_eq!(reopened.get_stats().total_vectors, 0);
        assert!(reopened.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn persist_then_reopen_preserves_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let ids = {
            let store = VectorStore::open(dir.path(), 2).await.unwrap();
            let ids = store
                .add_vectors(vec![vec![0.6, 0.8]], vec![meta("hello")])
                .await
                .unwrap();
            store.persist().unwrap();
            ids
        };

        let store2 = VectorStore::open(dir.path(), 2).await.unwrap();
        let stats = store2.get_stats();
        assert_eq!(stats.active_vectors, 1);
        assert_eq!(stats.dimension, 2);
        let hits = store2.search_with_metadata(&[0.6, 0.8], 1).unwrap();
        assert_eq!(hits[0].id, ids[0]);
        assert_eq!(hits[0].text, "hello");
    }

    #[test]
    fn flattens_nested_metadata() {
        let mut nested = Map::new();
        nested.insert("doc_id".to_string(), Value::String("d1".to_string()));
        let mut outer = Map::new();
        outer.insert("text".to_string(), Value::String("t".to_string()));
        outer.insert("metadata".to_string(), Value::Object(nested));

        let flat = flatten_metadata(outer);
        assert_eq!(flat.get("doc_id").unwrap(), "d1");
        assert!(!flat.contains_key("metadata"));
    }
}
