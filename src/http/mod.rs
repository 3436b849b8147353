//! C16 — HTTP surface: the full endpoint table (§6), grounded on the
//! `axum` + `tower-http` CORS/trace-layer pattern used by the pack's
//! axum-based agent server.

pub mod routes;
pub mod state;

pub use state::AppState;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_app(state: AppState) -> Router {
    let debug = state.config.api.debug;
    let max_file_bytes = (state.config.api.max_file_size_mb * 1024 * 1024) as usize;

    let cors = if debug {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/health/detailed", get(routes::health::health_detailed))
        .route("/stats", get(routes::stats::get_stats))
        .route("/documents", get(routes::stats::list_documents))
        .route("/config", get(routes::stats::get_config))
        .route("/query", post(routes::query::run_query))
        .route("/ingest", post(routes::ingest::ingest_text))
        .route(
            "/upload",
            post(routes::ingest::upload_file).layer(DefaultBodyLimit::max(max_file_bytes)),
        )
        .route("/documents/{*doc_path}", delete(routes::ingest::delete_document))
        .route("/clear", post(routes::ingest::clear_all))
        .route("/heartbeat/status", get(routes::heartbeat::status))
        .route("/heartbeat/start", post(routes::heartbeat::start))
        .route("/heartbeat/stop", post(routes::heartbeat::stop))
        .route("/heartbeat/logs", get(routes::heartbeat::logs))
        .route("/folder-monitor/status", get(routes::folder_monitor::status))
        .route("/folder-monitor/folders", get(routes::folder_monitor::folders))
        .route("/folder-monitor/files", get(routes::folder_monitor::files))
        .route("/folder-monitor/add", post(routes::folder_monitor::add))
        .route("/folder-monitor/remove", post(routes::folder_monitor::remove))
        .route("/folder-monitor/start", post(routes::folder_monitor::start))
        .route("/folder-monitor/stop", post(routes::folder_monitor::stop))
        .route("/folder-monitor/scan", post(routes::folder_monitor::scan))
        .route("/api/conversation/start", post(routes::conversation::start))
        .route("/api/conversation/message", post(routes::conversation::message))
        .route(
            "/api/conversation/history/{thread_id}",
            get(routes::conversation::history),
        )
        .route(
            "/api/conversation/end/{thread_id}",
            post(routes::conversation::end),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
