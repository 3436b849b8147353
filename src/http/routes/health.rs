use crate::http::state::AppState;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

/// GET /health — liveness summary.
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let status = state.heartbeat.status();
    let issues: Vec<String> = status
        .components
        .values()
        .filter(|c| c.health != crate::heartbeat::ComponentHealth::Healthy)
        .map(|c| format!("{}: {:?}", c.component, c.health))
        .collect();

    Json(json!({
        "status": status.overall,
        "components": status.components,
        "issues": issues,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /health/detailed — per-component probe with latency, forcing a fresh
/// check rather than serving stale history.
pub async fn health_detailed(State(state): State<AppState>) -> Json<Value> {
    let status = state.heartbeat.check_now().await;
    Json(json!({
        "status": status.overall,
        "components": status.components,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
