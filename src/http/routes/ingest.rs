use crate::errors::RagError;
use crate::http::state::AppState;
use axum::extract::{Multipart, Path, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;

const TEXT_INGEST_DEADLINE_SECS: u64 = 120;
const FILE_INGEST_DEADLINE_SECS: u64 = 300;

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Normalizes `user_metadata` the way §9's open question (b) resolves it: an
/// object is used as-is, a bare string is sugar for `{"description": s}`, and
/// anything else (number, array, bool) is rejected.
fn normalize_user_metadata(metadata: Value) -> Result<Map<String, Value>, RagError> {
    match metadata {
        Value::Null => Ok(Map::new()),
        Value::Object(m) => Ok(m),
        Value::String(s) => {
            let mut m = Map::new();
            m.insert("description".to_string(), Value::String(s));
            Ok(m)
        }
        _ => Err(RagError::api("metadata must be a JSON object or a plain string")),
    }
}

/// POST /ingest — ingest raw text under the text-ingest deadline.
pub async fn ingest_text(State(state): State<AppState>, Json(req): Json<IngestRequest>) -> Response {
    let metadata = match normalize_user_metadata(req.metadata) {
        Ok(m) => m,
        Err(e) => return e.into_response(),
    };
    let deadline = Duration::from_secs(TEXT_INGEST_DEADLINE_SECS);
    match tokio::time::timeout(deadline, state.ingestion.ingest_text(&req.text, metadata)).await {
        Ok(Ok(result)) => Json(result).into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(_) => deadline_exceeded(),
    }
}

/// POST /upload — multipart file upload: a `file` field plus an optional
/// `metadata` JSON field, under the file-ingest deadline.
pub async fn upload_file(State(state): State<AppState>, mut multipart: Multipart) -> Response {
    let mut file_bytes: Option<(String, Vec<u8>)> = None;
    let mut metadata = Map::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return RagError::api(format!("invalid multipart payload: {e}")).into_response(),
        };

        match field.name().unwrap_or("").to_string().as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = match field.bytes().await {
                    Ok(b) => b,
                    Err(e) => return RagError::api(format!("failed to read uploaded file: {e}")).into_response(),
                };
                file_bytes = Some((filename, bytes.to_vec()));
            }
            "metadata" => {
                let text = match field.text().await {
                    Ok(t) => t,
                    Err(e) => return RagError::api(format!("failed to read metadata field: {e}")).into_response(),
                };
                if !text.trim().is_empty() {
                    let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
                    metadata = match normalize_user_metadata(parsed) {
                        Ok(m) => m,
                        Err(e) => return e.into_response(),
                    };
                }
            }
            _ => {}
        }
    }

    let Some((filename, bytes)) = file_bytes else {
        return RagError::api("missing `file` field").into_response();
    };

    let tmp_dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => return RagError::storage(format!("failed to create staging dir: {e}")).into_response(),
    };
    let staged_path = tmp_dir.path().join(&filename);
    if let Err(e) = std::fs::write(&staged_path, &bytes) {
        return RagError::storage(format!("failed to stage uploaded file: {e}")).into_response();
    }

    let deadline = Duration::from_secs(FILE_INGEST_DEADLINE_SECS);
    match tokio::time::timeout(deadline, state.ingestion.ingest_file(&staged_path, metadata)).await {
        Ok(Ok(result)) => Json(json!({
            "status": result.status,
            "reason": result.reason,
            "file_id": result.file_id,
            "chunks_created": result.chunks_created,
            "is_update": result.is_update,
            "old_vectors_deleted": result.old_vectors_deleted,
            "vectors_stored": result.chunks_created,
        }))
        .into_response(),
        Ok(Err(e)) => e.into_response(),
        Err(_) => deadline_exceeded(),
    }
}

/// DELETE /documents/{doc_path} — delete a document and its vectors.
pub async fn delete_document(State(state): State<AppState>, Path(doc_path): Path<String>) -> Response {
    match state.ingestion.delete_file(&doc_path) {
        Ok(result) => Json(result).into_response(),
        Err(e) => e.into_response(),
    }
}

/// POST /clear — delete every vector and document record.
pub async fn clear_all(State(state): State<AppState>) -> Response {
    let stats_before = state.vector_store.get_stats();
    if let Err(e) = state.vector_store.clear_index().await {
        return e.into_response();
    }
    let documents_deleted = match state.metadata_store.clear() {
        Ok(n) => n,
        Err(e) => return e.into_response(),
    };

    Json(json!({
        "vectors_deleted": stats_before.active_vectors,
        "documents_deleted": documents_deleted,
        "chunks_deleted": stats_before.total_vectors,
    }))
    .into_response()
}

fn deadline_exceeded() -> Response {
    (
        axum::http::StatusCode::REQUEST_TIMEOUT,
        Json(json!({ "error": "deadline_exceeded", "message": "ingestion exceeded its deadline" })),
    )
        .into_response()
}
