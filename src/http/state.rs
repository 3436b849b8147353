//! Shared application state handed to every handler, grounded on the
//! `AppState` pattern used by the pack's axum-based agent server.

use crate::conversation::ConversationEngine;
use crate::embedder::Embedder;
use crate::folder_monitor::FolderMonitor;
use crate::heartbeat::HeartbeatMonitor;
use crate::ingestion::IngestionEngine;
use crate::metadata_store::FileMetadataStore;
use crate::query_engine::QueryEngine;
use crate::vector_store::VectorStore;
use crate::RAGConfig;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RAGConfig>,
    pub vector_store: Arc<VectorStore>,
    pub metadata_store: Arc<FileMetadataStore>,
    pub embedder: Arc<dyn Embedder>,
    pub ingestion: Arc<IngestionEngine>,
    pub query_engine: Arc<QueryEngine>,
    pub conversation: Arc<ConversationEngine>,
    pub folder_monitor: Arc<FolderMonitor>,
    pub heartbeat: Arc<HeartbeatMonitor>,
}
