use crate::errors::RagError;
use crate::http::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// POST /query — run a query under the configured retrieval deadline,
/// validating the query length and result cap per §6.
pub async fn run_query(State(state): State<AppState>, Json(req): Json<QueryRequest>) -> Response {
    if req.query.trim().is_empty() {
        return RagError::api("query must not be empty").into_response();
    }
    if req.query.chars().count() > state.config.api.max_query_chars {
        return RagError::api(format!(
            "query exceeds max_query_chars ({})",
            state.config.api.max_query_chars
        ))
        .into_response();
    }
    if let Some(max_results) = req.max_results {
        if max_results == 0 {
            return RagError::api("max_results must be at least 1").into_response();
        }
    }
    // max_results > cap is clamped rather than rejected, per the boundary behavior spec.
    let max_results = req.max_results.map(|n| n.min(state.config.api.max_results_cap));

    let deadline = std::time::Duration::from_secs(state.config.retrieval.deadline_secs);
    match tokio::time::timeout(
        deadline,
        state.query_engine.process_query(&req.query, max_results),
    )
    .await
    {
        Ok(Ok(response)) => {
            let context_used = response.sources.len();
            Json(json!({
                "query": response.query,
                "response": response.response,
                "sources": response.sources,
                "context_used": context_used,
                "total_sources": response.total_sources,
                "query_enhancement": response.query_enhancement,
                "timestamp": response.timestamp,
            }))
            .into_response()
        }
        Ok(Err(e)) => e.into_response(),
        Err(_) => (
            StatusCode::REQUEST_TIMEOUT,
            Json(json!({ "error": "deadline_exceeded", "message": "query exceeded its deadline" })),
        )
            .into_response(),
    }
}
