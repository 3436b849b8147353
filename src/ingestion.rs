//! C7 — Ingestion engine: extraction -> chunking -> embedding -> indexed
//! vectors, with per-document replace-on-update semantics and per-identity
//! serialization (§4.5, §5).

use crate::chunking::{Chunk, DocumentChunker, SemanticChunker, SizeBasedChunker};
use crate::config::ChunkingStrategy;
use crate::embedder::Embedder;
use crate::errors::{RagError, RagResult};
use crate::metadata_store::{FileIngestionRecord, FileMetadataStore};
use crate::processor_registry::ProcessorRegistry;
use crate::vector_store::{flatten_metadata, VectorStore};
use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Indexed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub reason: Option<String>,
    pub file_id: Option<String>,
    pub chunks_created: usize,
    pub is_update: bool,
    pub old_vectors_deleted: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResult {
    pub vectors_deleted: usize,
}

pub struct IngestionEngine {
    vector_store: Arc<VectorStore>,
    metadata_store: Arc<FileMetadataStore>,
    embedder: Arc<dyn Embedder>,
    processors: Arc<ProcessorRegistry>,
    chunker: DocumentChunker,
    /// One lock per document identity, so concurrent ingests of the same
    /// identity serialize while different identities proceed in parallel.
    identity_locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl IngestionEngine {
    /// Builds the engine with the size-based chunking strategy (chunk-size
    /// overlap, no sentence-embedding boundary detection). Most callers that
    /// don't care about the chunking strategy knob should use this.
    pub fn new(
        vector_store: Arc<VectorStore>,
        metadata_store: Arc<FileMetadataStore>,
        embedder: Arc<dyn Embedder>,
        processors: Arc<ProcessorRegistry>,
        chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            vector_store,
            metadata_store,
            embedder,
            processors,
            chunker: DocumentChunker::SizeBased(SizeBasedChunker::new(chunk_size, chunk_overlap)),
            identity_locks: DashMap::new(),
        }
    }

    /// Builds the engine honoring `chunking.strategy` (§4.3): size-based or
    /// semantic (sentence-embedding boundary detection via the same
    /// embedder used for indexing, falling back to size-based if it fails).
    #[allow(clippy::too_many_arguments)]
    pub fn with_strategy(
        vector_store: Arc<VectorStore>,
        metadata_store: Arc<FileMetadataStore>,
        embedder: Arc<dyn Embedder>,
        processors: Arc<ProcessorRegistry>,
        strategy: ChunkingStrategy,
        chunk_size: usize,
        chunk_overlap: usize,
        similarity_threshold: f32,
    ) -> Self {
        let chunker = match strategy {
            ChunkingStrategy::SizeBased => {
                DocumentChunker::SizeBased(SizeBasedChunker::new(chunk_size, chunk_overlap))
            }
            ChunkingStrategy::Semantic => DocumentChunker::Semantic(SemanticChunker::new(
                Some(embedder.clone()),
                similarity_threshold,
                chunk_size,
                chunk_overlap,
            )),
        };
        Self {
            vector_store,
            metadata_store,
            embedder,
            processors,
            chunker,
            identity_locks: DashMap::new(),
        }
    }

    fn identity_lock(&self, identity: &str) -> Arc<AsyncMutex<()>> {
        self.identity_locks
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Document identity: user `doc_path` > user `filename` > derived from
    /// `file_path`.
    fn document_identity(user_metadata: &Map<String, Value>, file_path: Option<&str>) -> String {
        if let Some(v) = user_metadata.get("doc_path").and_then(|v| v.as_str()) {
            return v.to_string();
        }
        if let Some(v) = user_metadata.get("filename").and_then(|v| v.as_str()) {
            return v.to_string();
        }
        if let Some(path) = file_path {
            return path.to_string();
        }
        format!("text#{}", uuid::Uuid::new_v4())
    }

    /// Derives the `doc_id` grouping key from a document identity (a
    /// `doc_path` or `file_path`): strips a leading path separator and
    /// collapses the remaining ones into underscores, e.g. `/geo/paris` ->
    /// `geo_paris`.
    fn doc_id_for(identity: &str) -> String {
        identity
            .trim_start_matches(['/', '\\'])
            .replace(['/', '\\'], "_")
    }

    /// Finds all non-deleted vectors belonging to `identity`, checked in the
    /// order: doc_path, filename, file_path.
    fn find_existing_vectors(&self, identity: &str) -> Vec<i64> {
        for key in ["doc_path", "filename", "file_path"] {
            let ids = self.vector_store.find_ids_by_field(key, identity);
            if !ids.is_empty() {
                return ids;
            }
        }
        Vec::new()
    }

    pub async fn ingest_text(
        &self,
        text: &str,
        mut user_metadata: Map<String, Value>,
    ) -> RagResult<IngestResult> {
        let identity = Self::document_identity(&user_metadata, None);
        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().await;

        if text.trim().is_empty() {
            return Ok(IngestResult {
                status: IngestStatus::Skipped,
                reason: Some("no_content".to_string()),
                file_id: None,
                chunks_created: 0,
                is_update: false,
                old_vectors_deleted: 0,
            });
        }

        user_metadata
            .entry("source_type".to_string())
            .or_insert(Value::String("text".to_string()));

        let chunks = self.chunker.chunk(text).await;
        self.index_chunks(&identity, chunks, user_metadata, 0, "text".to_string())
            .await
    }

    pub async fn ingest_file(
        &self,
        path: &Path,
        mut user_metadata: Map<String, Value>,
    ) -> RagResult<IngestResult> {
        let file_path = path.to_string_lossy().to_string();
        let identity = Self::document_identity(&user_metadata, Some(&file_path));
        let lock = self.identity_lock(&identity);
        let _guard = lock.lock().await;

        user_metadata
            .entry("file_path".to_string())
            .or_insert(Value::String(file_path.clone()));

        let result = self.processors.process(path);
        if result.text.trim().is_empty() {
            return Ok(IngestResult {
                status: IngestStatus::Skipped,
                reason: Some("no_content".to_string()),
                file_id: None,
                chunks_created: 0,
                is_update: false,
                old_vectors_deleted: 0,
            });
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt")
            .to_lowercase();
        user_metadata
            .entry("source_type".to_string())
            .or_insert(Value::String(extension.clone()));
        user_metadata
            .entry("filename".to_string())
            .or_insert(Value::String(
                path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
            ));

        // Step 4: use the processor's own pre-chunked, structurally-tagged
        // output when it produced one (PDF pages, spreadsheet sheets, form
        // fields); otherwise run the configured chunker over the flat text.
        let chunks = match result.chunks {
            Some(chunks) => chunks,
            None => self.chunker.chunk(&result.text).await,
        };
        let file_size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);

        self.index_chunks(&identity, chunks, user_metadata, file_size, extension)
            .await
    }

    async fn index_chunks(
        &self,
        identity: &str,
        chunks: Vec<Chunk>,
        user_metadata: Map<String, Value>,
        file_size: u64,
        file_type: String,
    ) -> RagResult<IngestResult> {
        if chunks.is_empty() {
            return Ok(IngestResult {
                status: IngestStatus::Skipped,
                reason: Some("no_content".to_string()),
                file_id: None,
                chunks_created: 0,
                is_update: false,
                old_vectors_deleted: 0,
            });
        }

        // Step 2: replace-on-update.
        let old_ids = self.find_existing_vectors(identity);
        let old_vectors_deleted = if old_ids.is_empty() {
            0
        } else {
            self.vector_store.delete_vectors(&old_ids)
        };
        let is_update = old_vectors_deleted > 0;

        // Step 4/5: attach document metadata, flatten, embed.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_texts(&texts).await?;

        let mut metas = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let mut meta = user_metadata.clone();
            for (k, v) in chunk.metadata.clone() {
                meta.entry(k).or_insert(v);
            }
            meta.insert("doc_path".to_string(), Value::String(identity.to_string()));
            meta.entry("doc_id".to_string())
                .or_insert_with(|| Value::String(Self::doc_id_for(identity)));
            meta.insert("text".to_string(), Value::String(chunk.text.clone()));
            meta.insert(
                "chunk_index".to_string(),
                Value::Number((chunk.chunk_index as u64).into()),
            );
            meta.insert(
                "ingested_at".to_string(),
                Value::String(Utc::now().to_rfc3339()),
            );
            metas.push(flatten_metadata(meta));
        }

        // Step 6: index.
        let vector_ids = self.vector_store.add_vectors(vectors, metas).await?;
        self.vector_store.persist()?;

        // Step 7: file ingestion record. A failure here is logged, not fatal.
        let record = FileIngestionRecord {
            file_id: String::new(),
            file_path: identity.to_string(),
            file_size,
            file_type,
            ingested_at: Utc::now(),
            chunk_count: vector_ids.len(),
            vector_ids: vector_ids.clone(),
            user_metadata,
            superseded: false,
        };
        let file_id = match self.metadata_store.put(record) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "failed to write file ingestion record");
                None
            }
        };

        Ok(IngestResult {
            status: IngestStatus::Indexed,
            reason: None,
            file_id,
            chunks_created: vector_ids.len(),
            is_update,
            old_vectors_deleted,
        })
    }

    pub async fn ingest_directory(
        &self,
        dir: &Path,
        patterns: &[String],
    ) -> Vec<(String, RagResult<IngestResult>)> {
        let mut results = Vec::new();
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if !patterns.is_empty() && !patterns.iter().any(|p| glob_match(p, name)) {
                continue;
            }
            let result = self.ingest_file(path, Map::new()).await;
            results.push((path.to_string_lossy().to_string(), result));
        }
        results
    }

    /// Deletes all vectors belonging to `identity` (a `doc_path` or
    /// `file_path`). Deleting a non-existent identity is a successful no-op.
    pub fn delete_file(&self, identity: &str) -> RagResult<DeleteResult> {
        let ids = self.find_existing_vectors(identity);
        let deleted = self.vector_store.delete_vectors(&ids);
        self.vector_store.persist()?;
        Ok(DeleteResult {
            vectors_deleted: deleted,
        })
    }
}

fn glob_match(pattern: &str, name: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        return name.ends_with(suffix);
    }
    pattern == name || pattern == "*"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Embedder;
    use async_trait::async_trait;

    struct FixedEmbedder {
        dim: usize,
    }

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed_text(&self, text: &str) -> RagResult<Vec<f32>> {
            Ok(self.embed_texts(&[text.to_string()]).await?.remove(0))
        }
        async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dim];
                    v[0] = t.len() as f32;
                    v
                })
                .collect())
        }
        fn get_dimension(&self) -> usize {
            self.dim
        }
    }

    async fn engine(dir: &Path) -> IngestionEngine {
        let vs = Arc::new(VectorStore::open(dir, 4).await.unwrap());
        let ms = Arc::new(FileMetadataStore::open(dir).unwrap());
        let embedder: Arc<dyn Embedder> = Arc::new(FixedEmbedder { dim: 4 });
        let processors = Arc::new(ProcessorRegistry::new());
        IngestionEngine::new(vs, ms, embedder, processors, 1750, 200)
    }

    #[tokio::test]
    async fn ingest_empty_text_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path()).await;
        let result = eng.ingest_text("   ", Map::new()).await.unwrap();
        assert_eq!(result.status, IngestStatus::Skipped);
        assert_eq!(result.reason.as_deref(), Some("no_content"));
    }

    #[tokio::test]
    async fn reingest_same_identity_replaces_old_vectors() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path()).await;

        let mut meta = Map::new();
        meta.insert("doc_path".to_string(), Value::String("/geo/paris".to_string()));

        let first = eng
            .ingest_text("Paris is the capital of France.", meta.clone())
            .await
            .unwrap();
        assert_eq!(first.status, IngestStatus::Indexed);
        assert!(!first.is_update);

        let second = eng
            .ingest_text("Paris is a city in France.", meta)
            .await
            .unwrap();
        assert!(second.is_update);
        assert_eq!(second.old_vectors_deleted, first.chunks_created);
    }

    #[tokio::test]
    async fn doc_id_derived_from_doc_path() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path()).await;

        let mut meta = Map::new();
        meta.insert("doc_path".to_string(), Value::String("/geo/paris".to_string()));
        eng.ingest_text("Paris is the capital of France.", meta).await.unwrap();

        let hits = eng
            .vector_store
            .search_with_metadata(&eng.embedder.embed_text("Paris").await.unwrap(), 5)
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].doc_id.starts_with("geo_paris"));
    }

    #[tokio::test]
    async fn delete_nonexistent_identity_is_success_zero() {
        let dir = tempfile::tempdir().unwrap();
        let eng = engine(dir.path()).await;
        let result = eng.delete_file("/does/not/exist").unwrap();
        assert_eq!(result.vectors_deleted, 0);
    }
}
