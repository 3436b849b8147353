use crate::http::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub thread_id: Option<String>,
}

/// POST /api/conversation/start
pub async fn start(State(state): State<AppState>, Json(req): Json<StartRequest>) -> Response {
    match state.conversation.start_conversation(req.thread_id).await {
        Ok(conv_state) => Json(json!({
            "thread_id": conv_state.thread_id,
            "messages": conv_state.messages,
            "turn_count": conv_state.turn_count,
            "current_phase": conv_state.current_phase,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub thread_id: String,
    pub message: String,
}

/// POST /api/conversation/message
pub async fn message(State(state): State<AppState>, Json(req): Json<MessageRequest>) -> Response {
    match state.conversation.send_message(&req.thread_id, &req.message).await {
        Ok(conv_state) => Json(json!({
            "response": conv_state.generated_response,
            "turn_count": conv_state.turn_count,
            "current_phase": conv_state.current_phase,
            "confidence_score": conv_state.response_confidence,
            "sources": conv_state.search_results,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub max_messages: Option<usize>,
}

/// GET /api/conversation/history/{thread_id}
pub async fn history(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Response {
    match state.conversation.history(&thread_id, params.max_messages) {
        Some(conv_state) => Json(json!({
            "messages": conv_state.messages,
            "turn_count": conv_state.turn_count,
            "current_phase": conv_state.current_phase,
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": format!("unknown thread_id: {thread_id}") })),
        )
            .into_response(),
    }
}

/// POST /api/conversation/end/{thread_id}
pub async fn end(State(state): State<AppState>, Path(thread_id): Path<String>) -> Response {
    match state.conversation.end_conversation(&thread_id).await {
        Ok(summary) => {
            let total_turns = summary.turn_count;
            Json(json!({ "summary": summary, "total_turns": total_turns })).into_response()
        }
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "message": format!("unknown thread_id: {thread_id}") })),
        )
            .into_response(),
    }
}
