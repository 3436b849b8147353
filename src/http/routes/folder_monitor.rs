use crate::errors::RagError;
use crate::http::state::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct FolderPathRequest {
    pub folder_path: PathBuf,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_recursive() -> bool {
    true
}

/// GET /folder-monitor/status
pub async fn status(State(state): State<AppState>) -> Response {
    Json(state.folder_monitor.status()).into_response()
}

/// GET /folder-monitor/folders
pub async fn folders(State(state): State<AppState>) -> Response {
    Json(json!({ "folders": state.folder_monitor.list_folders() })).into_response()
}

/// GET /folder-monitor/files
pub async fn files(State(state): State<AppState>) -> Response {
    Json(json!({ "files": state.folder_monitor.list_files() })).into_response()
}

/// POST /folder-monitor/add — idempotent per §4.10.
pub async fn add(State(state): State<AppState>, Json(req): Json<FolderPathRequest>) -> Response {
    if !req.folder_path.is_dir() {
        return RagError::api(format!("not a directory: {}", req.folder_path.display())).into_response();
    }
    let already_watched = state.folder_monitor.list_folders().contains(&req.folder_path);
    let files_found = state
        .folder_monitor
        .add_folder(req.folder_path.clone(), req.patterns, req.recursive);
    Json(json!({
        "folder_path": req.folder_path,
        "already_watched": already_watched,
        "files_found": files_found,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct RemoveFolderRequest {
    pub folder_path: PathBuf,
}

/// POST /folder-monitor/remove
pub async fn remove(State(state): State<AppState>, Json(req): Json<RemoveFolderRequest>) -> Response {
    let removed = state.folder_monitor.remove_folder(&req.folder_path);
    Json(json!({ "folder_path": req.folder_path, "removed": removed })).into_response()
}

/// POST /folder-monitor/start — idempotent.
pub async fn start(State(state): State<AppState>) -> Response {
    state.folder_monitor.start();
    Json(json!({ "running": true })).into_response()
}

/// POST /folder-monitor/stop
pub async fn stop(State(state): State<AppState>) -> Response {
    state.folder_monitor.stop().await;
    Json(json!({ "running": false })).into_response()
}

/// POST /folder-monitor/scan — waits for an in-progress scan and returns its
/// outcome if one is already running (scans serialize with themselves).
pub async fn scan(State(state): State<AppState>) -> Response {
    match state.folder_monitor.force_scan().await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => e.into_response(),
    }
}
