use crate::http::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

/// GET /stats — index/system stats.
pub async fn get_stats(State(state): State<AppState>) -> Json<Value> {
    let vector_stats = state.vector_store.get_stats();
    let documents = state.metadata_store.list_active();

    Json(json!({
        "total_vectors": vector_stats.total_vectors,
        "active_vectors": vector_stats.active_vectors,
        "total_documents": documents.len(),
        "embedding_model": state.config.embedding.model,
        "vector_dimensions": state.embedder.get_dimension(),
        "index_type": vector_stats.index_type,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /documents — list documents with chunk counts.
pub async fn list_documents(State(state): State<AppState>) -> Json<Value> {
    let records = state.metadata_store.list_active();
    let document_details: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "file_id": r.file_id,
                "file_path": r.file_path,
                "file_size": r.file_size,
                "file_type": r.file_type,
                "ingested_at": r.ingested_at.to_rfc3339(),
                "chunk_count": r.chunk_count,
            })
        })
        .collect();

    Json(json!({
        "documents": records.iter().map(|r| r.file_path.clone()).collect::<Vec<_>>(),
        "total_documents": records.len(),
        "document_details": document_details,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /config — non-secret configuration surface.
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "environment": config.environment,
        "api": {
            "host": config.api.host,
            "port": config.api.port,
            "debug": config.api.debug,
            "max_query_chars": config.api.max_query_chars,
            "max_results_cap": config.api.max_results_cap,
        },
        "embedding": {
            "provider": config.embedding.provider,
            "model": config.embedding.model,
        },
        "llm": {
            "provider": config.llm.provider,
            "model": config.llm.model,
        },
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
