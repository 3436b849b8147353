//! C4 — Embedder: text -> fixed-dimension vector, batched, provider-
//! polymorphic over {local-model, remote-API-provider-A, remote-API-provider-B}.

use crate::embeddings::e5::{E5Config, E5Embeddings};
use crate::embeddings::EmbeddingModel;
use crate::errors::{RagError, RagResult};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

/// Every embedder implementation preserves input order and fails the whole
/// batch on any item failure (no partial batches).
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> RagResult<Vec<f32>>;
    async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>>;
    fn get_dimension(&self) -> usize;
}

/// Local ONNX model (the teacher's E5 embedder), run on the blocking thread
/// pool since `ort` inference is CPU-bound and synchronous.
pub struct LocalEmbedder {
    inner: Arc<E5Embeddings>,
}

impl LocalEmbedder {
    pub fn load(model_dir: &Path) -> RagResult<Self> {
        let config = E5Config::auto_detect(model_dir)
            .ok_or_else(|| RagError::configuration("no local embedding model found in model_dir"))?;
        let inner = E5Embeddings::new(config)
            .map_err(|e| RagError::configuration(format!("failed to load embedding model: {e}")))?;
        Ok(Self {
            inner: Arc::new(inner),
        })
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_text(&self, text: &str) -> RagResult<Vec<f32>> {
        let inner = self.inner.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || inner.embed_query(&text))
            .await
            .map_err(|e| RagError::embedding(format!("embedding task panicked: {e}")))?
            .map_err(|e| RagError::embedding(format!("embedding failed: {e}")))
    }

    async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let inner = self.inner.clone();
        let texts: Vec<String> = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
            inner.embed_documents(&refs)
        })
        .await
        .map_err(|e| RagError::embedding(format!("embedding task panicked: {e}")))?
        .map_err(|e| RagError::embedding(format!("batch embedding failed: {e}")))
    }

    fn get_dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// A remote embedding API (provider A/B in the spec's terms), reached over
/// HTTP. Missing credentials are a fatal configuration error, not a runtime
/// failure, per §4.2.
pub struct RemoteEmbedder {
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
    client: Client,
}

impl RemoteEmbedder {
    pub fn new(
        endpoint: String,
        api_key: Option<String>,
        model: String,
        dimension: usize,
    ) -> RagResult<Self> {
        let api_key = api_key.ok_or_else(|| {
            RagError::configuration("missing API key for remote embedding provider")
        })?;
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| RagError::configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            endpoint,
            api_key,
            model,
            dimension,
            client,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed_text(&self, text: &str) -> RagResult<Vec<f32>> {
        Ok(self.embed_texts(&[text.to_string()]).await?.remove(0))
    }

    async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
        let body = json!({ "model": self.model, "input": texts });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::embedding(format!("remote embedding request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(RagError::embedding(format!(
                "remote embedding provider returned HTTP {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct EmbeddingItem {
            embedding: Vec<f32>,
        }
        #[derive(serde::Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingItem>,
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| RagError::embedding(format!("invalid embedding response: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(RagError::embedding(
                "remote embedding provider returned a mismatched batch size",
            ));
        }
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn get_dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remote_embedder_requires_api_key() {
        let result = RemoteEmbedder::new(
            "https://example.invalid/v1/embeddings".to_string(),
            None,
            "test-model".to_string(),
            384,
        );
        assert!(result.is_err());
    }
}
