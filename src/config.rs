//! C1 — Typed, layered configuration.
//!
//! A base `RAGConfig` is loaded from a JSON file (or defaulted), then
//! overridden field-by-field by the `RAG_*` environment variables. Unknown
//! environment keys are ignored.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RAGConfig {
    pub environment: String,
    pub data_dir: PathBuf,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub search: SearchConfig,
    pub retrieval: RetrievalConfig,
    pub llm: LlmConfig,
    pub api: ApiConfig,
    pub enhancer: EnhancerConfig,
    pub folder_monitor: FolderMonitorConfig,
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub model_dir: PathBuf,
    pub dimension: usize,
    pub use_e5: bool,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub strategy: ChunkingStrategy,
    pub similarity_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    SizeBased,
    Semantic,
}

/// Internal scoring knobs (RRF fusion weight, candidate over-fetch multiplier).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub default_k: usize,
    pub candidate_multiplier: usize,
    pub min_score_threshold: f32,
    pub hybrid_alpha: f32,
    pub rrf_k: usize,
    /// Weight for original similarity scores in RRF fusion (0.0 = pure RRF, higher = more score influence)
    pub score_weight: f32,
}

/// Query engine (C11) retrieval knobs — §4.7 of the spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub enable_reranking: bool,
    pub rerank_top_k: usize,
    pub max_query_variants: usize,
    pub deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
    pub deadline_secs: u64,
    pub default_max_tokens: usize,
    pub default_temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub max_query_chars: usize,
    pub max_results_cap: usize,
    pub max_file_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnhancerConfig {
    pub enabled: bool,
    pub max_variants: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderMonitorConfig {
    pub check_interval_secs: u64,
    pub recursive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub enable_reranking: bool,
    pub enable_knowledge_graph: bool,
    pub enable_cross_encoder: bool,
}

impl RAGConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.chunking.chunk_size < 50 {
            return Err("chunking.chunk_size must be >= 50".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.search.default_k == 0 {
            return Err("search.default_k must be > 0".into());
        }
        if self.search.candidate_multiplier == 0 {
            return Err("search.candidate_multiplier must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.search.min_score_threshold) {
            return Err("search.min_score_threshold must be in [0.0, 1.0]".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err("retrieval.similarity_threshold must be in [0.0, 1.0]".into());
        }
        if self.api.max_results_cap == 0 {
            return Err("api.max_results_cap must be > 0".into());
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields,
    /// then apply `RAG_*` environment overrides on top.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let mut config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a file if `RAG_CONFIG_PATH` / the given default path exists,
    /// otherwise fall back to built-in defaults. Always applies env overrides.
    pub fn load(default_path: &Path) -> Result<Self, String> {
        let path = std::env::var("RAG_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_path.to_path_buf());

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            let mut c = Self::default();
            c.apply_env_overrides();
            c
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply recognized `RAG_*` environment variables over the current values.
    /// Unknown environment keys are ignored, per the external interfaces spec.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RAG_ENVIRONMENT") {
            self.environment = v;
        }
        if let Ok(v) = std::env::var("RAG_DEBUG") {
            self.api.debug = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Ok(v) = std::env::var("RAG_API_HOST") {
            self.api.host = v;
        }
        if let Ok(v) = std::env::var("RAG_API_PORT") {
            if let Ok(port) = v.parse() {
                self.api.port = port;
            }
        }
        if let Ok(v) = std::env::var("RAG_LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Ok(v) = std::env::var("RAG_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("RAG_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("RAG_EMBEDDING_PROVIDER") {
            self.embedding.provider = v;
        }
        if let Ok(v) = std::env::var("RAG_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        // RAG_LOG_LEVEL is consumed directly by `crate::logging::init`, not stored here.
    }
}

impl Default for RAGConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ragcore");

        let model_dir = if Path::new("models").exists() {
            PathBuf::from("models")
        } else if let Ok(env_path) = std::env::var("MODEL_PATH") {
            PathBuf::from(env_path)
        } else {
            data_dir.join("models")
        };

        let e5_available = model_dir.join("multilingual-e5-base").exists();
        let dimension = if e5_available { 768 } else { 384 };

        Self {
            environment: "development".to_string(),
            data_dir,
            embedding: EmbeddingConfig {
                provider: "local".to_string(),
                model: if e5_available { "multilingual-e5-base".to_string() } else { "local-mini".to_string() },
                model_dir,
                dimension,
                use_e5: e5_available,
                cache_size: 1000,
            },
            chunking: ChunkingConfig {
                chunk_size: 1750,
                chunk_overlap: 200,
                min_chunk_size: 100,
                strategy: ChunkingStrategy::SizeBased,
                similarity_threshold: 0.6,
            },
            search: SearchConfig {
                default_k: 10,
                candidate_multiplier: 3,
                min_score_threshold: 0.1,
                hybrid_alpha: 0.7,
                rrf_k: 60,
                score_weight: 0.3,
            },
            retrieval: RetrievalConfig {
                top_k: 5,
                similarity_threshold: 0.1,
                enable_reranking: true,
                rerank_top_k: 5,
                max_query_variants: 3,
                deadline_secs: 30,
            },
            llm: LlmConfig {
                provider: "disabled".to_string(),
                model: "none".to_string(),
                api_key: None,
                deadline_secs: 30,
                default_max_tokens: 512,
                default_temperature: 0.2,
            },
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 8088,
                debug: false,
                max_query_chars: 1000,
                max_results_cap: 10,
                max_file_size_mb: 100,
            },
            enhancer: EnhancerConfig {
                enabled: true,
                max_variants: 3,
            },
            folder_monitor: FolderMonitorConfig {
                check_interval_secs: 30,
                recursive: true,
            },
            features: FeatureFlags {
                enable_reranking: true,
                enable_knowledge_graph: false,
                enable_cross_encoder: true,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(RAGConfig::default().validate().is_ok());
    }

    #[test]
    fn env_override_applies_and_ignores_unknown_keys() {
        std::env::set_var("RAG_API_PORT", "9999");
        std::env::set_var("RAG_SOME_UNKNOWN_KEY", "whatever");
        let mut config = RAGConfig::default();
        config.apply_env_overrides();
        assert_eq!(config.api.port, 9999);
        std::env::remove_var("RAG_API_PORT");
        std::env::remove_var("RAG_SOME_UNKNOWN_KEY");
    }

    #[test]
    fn rejects_bad_similarity_threshold() {
        let mut config = RAGConfig::default();
        config.retrieval.similarity_threshold = 2.0;
        assert!(config.validate().is_err());
    }
}
