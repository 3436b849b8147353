//! Structured logging setup (ambient stack).
//!
//! Reads `RAG_LOG_LEVEL` (defaulting to `info`) and installs a `tracing`
//! subscriber with an `EnvFilter`, matching the logging conventions already
//! used throughout the crate (`tracing::info!`/`warn!`/`error!` with
//! structured fields).

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber. Safe to call once at process
/// startup; subsequent calls are no-ops (the underlying `set_global_default`
/// failure is swallowed, matching the teacher crate's tolerance for
/// double-init in tests).
pub fn init() {
    let level = std::env::var("RAG_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
