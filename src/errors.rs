//! Error taxonomy shared across every component.
//!
//! Each variant names a `kind` from the design's error taxonomy and carries
//! a severity plus a structured details map, so the HTTP boundary can map
//! errors to status codes without re-deriving what went wrong.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    #[error("configuration error: {message}")]
    Configuration {
        message: String,
        severity: Severity,
        details: Map<String, Value>,
    },

    #[error("storage error: {message}")]
    Storage {
        message: String,
        severity: Severity,
        details: Map<String, Value>,
    },

    #[error("ingestion error: {message}")]
    Ingestion {
        message: String,
        severity: Severity,
        details: Map<String, Value>,
    },

    #[error("embedding error: {message}")]
    Embedding {
        message: String,
        severity: Severity,
        details: Map<String, Value>,
    },

    #[error("retrieval error: {message}")]
    Retrieval {
        message: String,
        severity: Severity,
        details: Map<String, Value>,
    },

    #[error("llm error: {message}")]
    Llm {
        message: String,
        severity: Severity,
        provider: Option<String>,
        model: Option<String>,
    },

    #[error("api error: {message}")]
    Api {
        message: String,
        severity: Severity,
        details: Map<String, Value>,
    },
}

impl RagError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            severity: Severity::Critical,
            details: Map::new(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            severity: Severity::High,
            details: Map::new(),
        }
    }

    pub fn ingestion(message: impl Into<String>) -> Self {
        Self::Ingestion {
            message: message.into(),
            severity: Severity::Medium,
            details: Map::new(),
        }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        Self::Embedding {
            message: message.into(),
            severity: Severity::High,
            details: Map::new(),
        }
    }

    pub fn retrieval(message: impl Into<String>) -> Self {
        Self::Retrieval {
            message: message.into(),
            severity: Severity::Medium,
            details: Map::new(),
        }
    }

    pub fn llm(message: impl Into<String>, provider: Option<String>, model: Option<String>) -> Self {
        Self::Llm {
            message: message.into(),
            severity: Severity::Medium,
            provider,
            model,
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            severity: Severity::Low,
            details: Map::new(),
        }
    }

    pub fn with_details(mut self, key: &str, value: impl Into<Value>) -> Self {
        match &mut self {
            Self::Configuration { details, .. }
            | Self::Storage { details, .. }
            | Self::Ingestion { details, .. }
            | Self::Embedding { details, .. }
            | Self::Retrieval { details, .. }
            | Self::Api { details, .. } => {
                details.insert(key.to_string(), value.into());
            }
            Self::Llm { .. } => {}
        }
        self
    }

    /// The taxonomy kind, as a stable lowercase tag (never the Rust type name).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Storage { .. } => "storage",
            Self::Ingestion { .. } => "ingestion",
            Self::Embedding { .. } => "embedding",
            Self::Retrieval { .. } => "retrieval",
            Self::Llm { .. } => "llm",
            Self::Api { .. } => "api",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Configuration { severity, .. }
            | Self::Storage { severity, .. }
            | Self::Ingestion { severity, .. }
            | Self::Embedding { severity, .. }
            | Self::Retrieval { severity, .. }
            | Self::Api { severity, .. }
            | Self::Llm { severity, .. } => *severity,
        }
    }
}

impl axum::response::IntoResponse for RagError {
    /// Maps a domain error to an HTTP status by kind, per the error handling
    /// design: 5xx responses additionally expose the taxonomy `type`.
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            Self::Configuration { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Ingestion { .. } => StatusCode::BAD_REQUEST,
            Self::Embedding { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Retrieval { .. } => StatusCode::BAD_REQUEST,
            Self::Llm { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Api { .. } => StatusCode::BAD_REQUEST,
        };

        let message = self.to_string();
        let body = if status.is_client_error() {
            serde_json::json!({ "error": self.kind(), "message": message })
        } else {
            serde_json::json!({ "error": self.kind(), "message": message, "type": self.kind() })
        };

        (status, axum::Json(body)).into_response()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

pub type RagResult<T> = std::result::Result<T, RagError>;
