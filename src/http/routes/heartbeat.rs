use crate::http::state::AppState;
use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    component: String,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    24
}

/// GET /heartbeat/status
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let status = state.heartbeat.status();
    Json(json!({
        "overall": status.overall,
        "components": status.components,
        "running": status.running,
    }))
}

/// POST /heartbeat/start
pub async fn start(State(state): State<AppState>) -> Json<Value> {
    state.heartbeat.start();
    Json(json!({ "running": true }))
}

/// POST /heartbeat/stop
pub async fn stop(State(state): State<AppState>) -> Json<Value> {
    state.heartbeat.stop();
    Json(json!({ "running": false }))
}

/// GET /heartbeat/logs?component=...&limit=...
pub async fn logs(State(state): State<AppState>, Query(params): Query<LogsQuery>) -> Json<Value> {
    let history = state.heartbeat.history(&params.component, params.limit);
    Json(json!({ "component": params.component, "history": history }))
}
