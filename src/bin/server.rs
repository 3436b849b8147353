//! Process entry point: loads configuration, constructs every component
//! (C1-C15), registers heartbeat probes, and serves the HTTP surface (C16).

use ragcore::config::RAGConfig;
use ragcore::container::ServiceContainer;
use ragcore::conversation::{ConversationEngine, ConversationStore};
use ragcore::embedder::{Embedder, LocalEmbedder, RemoteEmbedder};
use ragcore::enhancer::{QueryEnhancer, RuleBasedQueryEnhancer};
use ragcore::errors::{RagError, RagResult};
use ragcore::folder_monitor::FolderMonitor;
use ragcore::heartbeat::{ComponentHealth, FnProbe, HeartbeatMonitor};
use ragcore::http::{self, AppState};
use ragcore::ingestion::IngestionEngine;
use ragcore::llm::external::ExternalProvider;
use ragcore::llm::{ApiProvider, LLMProvider};
use ragcore::llm_client::{DisabledLlmClient, LlmClient, ProviderLlmClient};
use ragcore::metadata_store::FileMetadataStore;
use ragcore::processor_registry::ProcessorRegistry;
use ragcore::query_engine::{QueryEngine, QueryEngineConfig};
use ragcore::reranker::{CrossEncoderRerankerAdapter, LlmRerankerAdapter, Reranker};
use ragcore::reranking::cross_encoder::CrossEncoderReranker;
use ragcore::vector_store::VectorStore;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ragcore::logging::init();

    let default_config_path = std::path::PathBuf::from("config.json");
    let config = RAGConfig::load(&default_config_path)
        .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;
    let config = Arc::new(config);
    tracing::info!(environment = %config.environment, data_dir = %config.data_dir.display(), "starting ragcore-server");

    std::fs::create_dir_all(&config.data_dir)?;

    // Leaf resources with async or blocking constructors are built directly
    // here, then registered as instances so the container still mediates
    // the rest of the wiring (and exposes `get`/`has`/`list` the way C15
    // is specified).
    let container = ServiceContainer::new();

    let vector_store = Arc::new(VectorStore::open(&config.data_dir, config.embedding.dimension).await?);
    container.register_instance("vector_store", vector_store.clone());

    let metadata_store = Arc::new(
        FileMetadataStore::open(&config.data_dir)
            .map_err(|e| anyhow::anyhow!("failed to open metadata store: {e}"))?,
    );
    container.register_instance("metadata_store", metadata_store.clone());

    let embedder = build_embedder(&config)?;
    container.register_instance("embedder", embedder.clone());

    {
        let chunk_size = config.chunking.chunk_size;
        let chunk_overlap = config.chunking.chunk_overlap;
        container.register::<ProcessorRegistry, _>("processors", move |_c| {
            Ok(ProcessorRegistry::with_chunk_budget(chunk_size, chunk_overlap))
        });
    }
    let processors = container.get::<ProcessorRegistry>("processors")?;

    let ingestion = Arc::new(IngestionEngine::with_strategy(
        vector_store.clone(),
        metadata_store.clone(),
        embedder.clone(),
        processors.clone(),
        config.chunking.strategy,
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
        config.chunking.similarity_threshold,
    ));
    container.register_instance("ingestion", ingestion.clone());

    let enhancer: Option<Arc<dyn QueryEnhancer>> = if config.enhancer.enabled {
        Some(Arc::new(RuleBasedQueryEnhancer::new()))
    } else {
        None
    };

    let llm_client = build_llm_client(&config)?;
    container.register_instance("llm_client", llm_client.clone());

    let reranker = build_reranker(&config, llm_client.clone());

    let query_engine = Arc::new(QueryEngine::new(
        vector_store.clone(),
        embedder.clone(),
        enhancer,
        reranker,
        llm_client.clone(),
        QueryEngineConfig {
            top_k: config.retrieval.top_k,
            similarity_threshold: config.retrieval.similarity_threshold,
            enable_reranking: config.retrieval.enable_reranking && config.features.enable_reranking,
            rerank_top_k: config.retrieval.rerank_top_k,
            max_variants: config.retrieval.max_query_variants,
            max_tokens: config.llm.default_max_tokens,
            temperature: config.llm.default_temperature,
            deadline_secs: config.retrieval.deadline_secs,
        },
    ));
    container.register_instance("query_engine", query_engine.clone());

    let conversation_store = Arc::new(
        ConversationStore::open(&config.data_dir)
            .map_err(|e| anyhow::anyhow!("failed to open conversation store: {e}"))?,
    );
    let conversation = Arc::new(ConversationEngine::new(
        conversation_store,
        Some(query_engine.clone()),
    ));
    container.register_instance("conversation", conversation.clone());

    let folder_monitor = Arc::new(FolderMonitor::new(
        ingestion.clone(),
        std::time::Duration::from_secs(config.folder_monitor.check_interval_secs),
    ));
    folder_monitor.start();
    container.register_instance("folder_monitor", folder_monitor.clone());

    let heartbeat = Arc::new(HeartbeatMonitor::new(std::time::Duration::from_secs(30)));
    register_probes(&heartbeat, &vector_store, &embedder, &llm_client);
    heartbeat.start();
    container.register_instance("heartbeat", heartbeat.clone());

    tracing::info!(services = ?container.list(), "service container wired");

    let state = AppState {
        config: config.clone(),
        vector_store,
        metadata_store,
        embedder,
        ingestion,
        query_engine,
        conversation,
        folder_monitor,
        heartbeat,
    };

    let app = http::create_app(state);
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_embedder(config: &RAGConfig) -> RagResult<Arc<dyn Embedder>> {
    match config.embedding.provider.as_str() {
        "remote" => {
            let endpoint = std::env::var("RAG_EMBEDDING_ENDPOINT")
                .unwrap_or_else(|_| "https://api.openai.com/v1/embeddings".to_string());
            let api_key = std::env::var("RAG_EMBEDDING_API_KEY").ok();
            let remote = RemoteEmbedder::new(
                endpoint,
                api_key,
                config.embedding.model.clone(),
                config.embedding.dimension,
            )?;
            Ok(Arc::new(remote))
        }
        _ => {
            let local = LocalEmbedder::load(&config.embedding.model_dir)?;
            Ok(Arc::new(local))
        }
    }
}

/// Maps the configured provider name to the teacher's `ApiProvider` enum.
/// Anything unrecognized is treated as an OpenAI-compatible custom endpoint.
fn resolve_api_provider(name: &str) -> Option<ApiProvider> {
    match name.to_lowercase().as_str() {
        "disabled" | "none" => None,
        "openai" => Some(ApiProvider::OpenAI),
        "anthropic" => Some(ApiProvider::Anthropic),
        "openrouter" => Some(ApiProvider::OpenRouter),
        "together" => Some(ApiProvider::Together),
        "grok" => Some(ApiProvider::Grok),
        "perplexity" => Some(ApiProvider::Perplexity),
        "google" => Some(ApiProvider::Google),
        "replicate" => Some(ApiProvider::Replicate),
        "baseten" => Some(ApiProvider::Baseten),
        "ollama" => Some(ApiProvider::Ollama),
        other => Some(ApiProvider::Custom {
            endpoint: other.to_string(),
        }),
    }
}

fn build_llm_client(config: &RAGConfig) -> RagResult<Arc<dyn LlmClient>> {
    let Some(api_provider) = resolve_api_provider(&config.llm.provider) else {
        tracing::info!("LLM provider disabled; answers will be source-only");
        return Ok(Arc::new(DisabledLlmClient));
    };

    let api_key = config.llm.api_key.clone().ok_or_else(|| {
        RagError::configuration(format!(
            "LLM provider '{}' configured without an API key",
            config.llm.provider
        ))
    })?;

    let provider = ExternalProvider::new(api_provider, api_key, config.llm.model.clone())
        .map_err(|e| RagError::configuration(format!("failed to construct LLM provider: {e}")))?;

    Ok(Arc::new(ProviderLlmClient::new(
        Arc::new(provider) as Arc<dyn LLMProvider>,
        config.llm.provider.clone(),
        config.llm.model.clone(),
        config.llm.deadline_secs,
    )))
}

fn build_reranker(config: &RAGConfig, llm_client: Arc<dyn LlmClient>) -> Option<Arc<dyn Reranker>> {
    if !config.features.enable_reranking {
        return None;
    }
    if config.features.enable_cross_encoder {
        let model_dir = config.embedding.model_dir.join("cross-encoder");
        match CrossEncoderReranker::new(&model_dir) {
            Ok(inner) => return Some(Arc::new(CrossEncoderRerankerAdapter::new(inner))),
            Err(e) => {
                tracing::warn!(error = %e, "cross-encoder reranker unavailable, falling back to LLM reranking");
            }
        }
    }
    Some(Arc::new(LlmRerankerAdapter::new(llm_client)))
}

fn register_probes(
    heartbeat: &Arc<HeartbeatMonitor>,
    vector_store: &Arc<VectorStore>,
    embedder: &Arc<dyn Embedder>,
    llm_client: &Arc<dyn LlmClient>,
) {
    let vs = vector_store.clone();
    heartbeat.register(Arc::new(FnProbe::new("vector_store", move || {
        let vs = vs.clone();
        async move {
            let _ = vs.get_stats();
            (ComponentHealth::Healthy, None)
        }
    })));

    let dim = embedder.get_dimension();
    heartbeat.register(Arc::new(FnProbe::new("embedder", move || {
        let dim = dim;
        async move {
            if dim > 0 {
                (ComponentHealth::Healthy, None)
            } else {
                (ComponentHealth::Unhealthy, Some("embedder reports zero dimension".into()))
            }
        }
    })));

    let llm = llm_client.clone();
    heartbeat.register(Arc::new(FnProbe::new("llm", move || {
        let llm = llm.clone();
        async move {
            match llm.generate("ping", 1, 0.0).await {
                Ok(_) => (ComponentHealth::Healthy, None),
                Err(e) if e.kind() == "configuration" => (ComponentHealth::Degraded, Some(e.to_string())),
                Err(e) => (ComponentHealth::Unhealthy, Some(e.to_string())),
            }
        }
    })));
}
