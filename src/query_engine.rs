//! C11 — Query engine: enhancement -> multi-variant retrieval -> filtering
//! -> reranking -> grounded generation (§4.7).

use crate::embedder::Embedder;
use crate::enhancer::QueryEnhancer;
use crate::errors::RagResult;
use crate::llm_client::LlmClient;
use crate::reranker::{RerankCandidate, Reranker};
use crate::vector_store::{SearchResultWithMetadata, VectorStore};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct Source {
    pub text_preview: String,
    pub similarity_score: f32,
    pub rerank_score: Option<f32>,
    pub doc_id: String,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryVariantUsed {
    pub text: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub query: String,
    pub response: String,
    pub sources: Vec<Source>,
    pub total_sources: usize,
    pub query_enhancement: Option<Vec<QueryVariantUsed>>,
    pub timestamp: String,
}

/// A hit annotated with the variant that produced it, per §4.7 step 2.
#[derive(Clone)]
struct AnnotatedHit {
    hit: SearchResultWithMetadata,
    query_confidence: f32,
    weighted_score: f32,
}

pub struct QueryEngine {
    vector_store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    enhancer: Option<Arc<dyn QueryEnhancer>>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Arc<dyn LlmClient>,
    top_k: usize,
    similarity_threshold: f32,
    enable_reranking: bool,
    rerank_top_k: usize,
    max_variants: usize,
    max_tokens: usize,
    temperature: f32,
    deadline: std::time::Duration,
}

pub struct QueryEngineConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub enable_reranking: bool,
    pub rerank_top_k: usize,
    pub max_variants: usize,
    pub max_tokens: usize,
    pub temperature: f32,
    pub deadline_secs: u64,
}

impl QueryEngine {
    pub fn new(
        vector_store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        enhancer: Option<Arc<dyn QueryEnhancer>>,
        reranker: Option<Arc<dyn Reranker>>,
        llm: Arc<dyn LlmClient>,
        config: QueryEngineConfig,
    ) -> Self {
        Self {
            vector_store,
            embedder,
            enhancer,
            reranker,
            llm,
            top_k: config.top_k,
            similarity_threshold: config.similarity_threshold,
            enable_reranking: config.enable_reranking,
            rerank_top_k: config.rerank_top_k,
            max_variants: config.max_variants.max(1),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            deadline: std::time::Duration::from_secs(config.deadline_secs),
        }
    }

    pub async fn process_query(
        &self,
        query: &str,
        top_k: Option<usize>,
    ) -> RagResult<QueryResponse> {
        let k = top_k.unwrap_or(self.top_k).max(1);

        // Step 1: enhance, falling soft to the unenhanced single variant.
        let variants = self.variants(query);

        // Step 2: per-variant embed + search, annotated with confidence/weighted score.
        let mut merged: std::collections::HashMap<i64, AnnotatedHit> = std::collections::HashMap::new();
        for (text, confidence) in &variants {
            let embedding = match self.embedder.embed_text(text).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(variant = %text, error = %e, "failed to embed query variant, skipping");
                    continue;
                }
            };
            let hits = match self.vector_store.search_with_metadata(&embedding, k) {
                Ok(h) => h,
                Err(e) => {
                    tracing::warn!(variant = %text, error = %e, "search failed for query variant, skipping");
                    continue;
                }
            };

            for hit in hits {
                let weighted_score = hit.score * confidence;
                // Step 3: keep the occurrence with the highest weighted_score.
                merged
                    .entry(hit.id)
                    .and_modify(|existing| {
                        if weighted_score > existing.weighted_score {
                            *existing = AnnotatedHit {
                                hit: hit.clone(),
                                query_confidence: *confidence,
                                weighted_score,
                            };
                        }
                    })
                    .or_insert(AnnotatedHit {
                        hit,
                        query_confidence: *confidence,
                        weighted_score,
                    });
            }
        }

        let mut merged: Vec<AnnotatedHit> = merged.into_values().collect();
        // Ties: weighted_score desc, then confidence desc, then similarity desc, then vector_id asc.
        merged.sort_by(|a, b| {
            b.weighted_score
                .partial_cmp(&a.weighted_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.query_confidence.partial_cmp(&a.query_confidence).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| b.hit.score.partial_cmp(&a.hit.score).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.hit.id.cmp(&b.hit.id))
        });

        // Step 4: drop hits below the similarity threshold.
        merged.retain(|a| a.hit.score >= self.similarity_threshold);

        if merged.is_empty() {
            return Ok(QueryResponse {
                query: query.to_string(),
                response: "I don't have enough context to answer that question.".to_string(),
                sources: Vec::new(),
                total_sources: 0,
                query_enhancement: self.enhancement_summary(&variants),
                timestamp: Utc::now().to_rfc3339(),
            });
        }

        // Step 5: rerank survivors, or just take top_k.
        let mut rerank_scores: std::collections::HashMap<i64, f32> = std::collections::HashMap::new();
        if self.enable_reranking {
            if let Some(reranker) = &self.reranker {
                let candidates: Vec<RerankCandidate> = merged
                    .iter()
                    .map(|a| RerankCandidate {
                        id: a.hit.id,
                        text: a.hit.text.clone(),
                    })
                    .collect();
                match reranker.rerank(query, &candidates, self.rerank_top_k).await {
                    Ok(scored) => {
                        for (id, score) in scored {
                            rerank_scores.insert(id, score);
                        }
                        merged.retain(|a| rerank_scores.contains_key(&a.hit.id));
                        merged.sort_by(|a, b| {
                            rerank_scores[&b.hit.id]
                                .partial_cmp(&rerank_scores[&a.hit.id])
                                .unwrap_or(std::cmp::Ordering::Equal)
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reranking failed, bypassing");
                    }
                }
            }
        }
        if rerank_scores.is_empty() {
            merged.truncate(k);
        }

        // Step 6: grounded generation.
        let context_chunks: Vec<&str> = merged.iter().take(5).map(|a| a.hit.text.as_str()).collect();
        let prompt = format!(
            "Based on the following context, answer: {query}\n\nContext:\n{}\n\nAnswer:",
            context_chunks.join("\n\n")
        );

        let response = match tokio::time::timeout(
            self.deadline,
            self.llm.generate(&prompt, self.max_tokens, self.temperature),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "llm generation failed, returning sources without a synthesized answer");
                "I found relevant information, but I'm unable to generate a synthesized answer right now.".to_string()
            }
            Err(_) => {
                tracing::warn!("llm generation exceeded its deadline");
                "I found relevant information, but the answer generation timed out.".to_string()
            }
        };

        // Step 7: format sources.
        let sources: Vec<Source> = merged
            .iter()
            .map(|a| Source {
                text_preview: preview(&a.hit.text, 200),
                similarity_score: a.hit.score,
                rerank_score: rerank_scores.get(&a.hit.id).copied(),
                doc_id: a.hit.doc_id.clone(),
                metadata: a.hit.metadata.clone(),
            })
            .collect();

        Ok(QueryResponse {
            query: query.to_string(),
            response,
            total_sources: sources.len(),
            sources,
            query_enhancement: self.enhancement_summary(&variants),
            timestamp: Utc::now().to_rfc3339(),
        })
    }

    /// Produces up to `max_variants` `(text, confidence)` pairs, falling soft
    /// to `[(query, 1.0)]` if no enhancer is configured or it fails.
    fn variants(&self, query: &str) -> Vec<(String, f32)> {
        let Some(enhancer) = &self.enhancer else {
            return vec![(query.to_string(), 1.0)];
        };
        match enhancer.enhance(query) {
            Ok(enhanced) => {
                let mut variants = enhancer.variants(&enhanced);
                variants.insert(0, (query.to_string(), 1.0));
                let mut seen = std::collections::HashSet::new();
                variants.retain(|(text, _)| seen.insert(text.trim().to_lowercase()));
                variants.truncate(self.max_variants);
                variants
            }
            Err(e) => {
                tracing::warn!(error = %e, "query enhancement failed, falling back to unenhanced query");
                vec![(query.to_string(), 1.0)]
            }
        }
    }

    fn enhancement_summary(&self, variants: &[(String, f32)]) -> Option<Vec<QueryVariantUsed>> {
        if self.enhancer.is_none() {
            return None;
        }
        Some(
            variants
                .iter()
                .map(|(text, confidence)| QueryVariantUsed {
                    text: text.clone(),
                    confidence: *confidence,
                })
                .collect(),
        )
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::DisabledLlmClient;
    use async_trait::async_trait;
    use serde_json::Map;

    struct FixedEmbedder;
    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed_text(&self, text: &str) -> RagResult<Vec<f32>> {
            if text.contains("France") {
                Ok(vec![1.0, 0.0])
            } else {
                Ok(vec![0.0, 1.0])
            }
        }
        async fn embed_texts(&self, texts: &[String]) -> RagResult<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed_text(t).await?);
            }
            Ok(out)
        }
        fn get_dimension(&self) -> usize {
            2
        }
    }

    async fn store_with_one_vector(dir: &std::path::Path) -> Arc<VectorStore> {
        let store = VectorStore::open(dir, 2).await.unwrap();
        let mut meta = Map::new();
        meta.insert("text".to_string(), Value::String("Paris is the capital of France.".to_string()));
        meta.insert("doc_id".to_string(), Value::String("geo_paris".to_string()));
        store.add_vectors(vec![vec![1.0, 0.0]], vec![meta]).await.unwrap();
        Arc::new(store)
    }

    #[tokio::test]
    async fn returns_insufficient_context_when_below_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_one_vector(dir.path()).await;
        let engine = QueryEngine::new(
            store,
            Arc::new(FixedEmbedder),
            None,
            None,
            Arc::new(DisabledLlmClient),
            QueryEngineConfig {
                top_k: 5,
                similarity_threshold: 0.99,
                enable_reranking: false,
                rerank_top_k: 5,
                max_variants: 3,
                max_tokens: 256,
                temperature: 0.2,
                deadline_secs: 30,
            },
        );

        let result = engine.process_query("What is the capital of Germany?", None).await.unwrap();
        assert!(result.sources.is_empty());
        assert_eq!(result.total_sources, 0);
    }

    #[tokio::test]
    async fn surfaces_matching_source_above_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_one_vector(dir.path()).await;
        let engine = QueryEngine::new(
            store,
            Arc::new(FixedEmbedder),
            None,
            None,
            Arc::new(DisabledLlmClient),
            QueryEngineConfig {
                top_k: 5,
                similarity_threshold: 0.1,
                enable_reranking: false,
                rerank_top_k: 5,
                max_variants: 3,
                max_tokens: 256,
                temperature: 0.2,
                deadline_secs: 30,
            },
        );

        let result = engine.process_query("What is the capital of France?", None).await.unwrap();
        assert_eq!(result.total_sources, 1);
        assert_eq!(result.sources[0].doc_id, "geo_paris");
        assert!(result.sources[0].similarity_score >= 0.1);
    }

    #[test]
    fn preview_truncates_long_text() {
        let long = "a".repeat(300);
        let p = preview(&long, 200);
        assert_eq!(p.chars().count(), 203);
        assert!(p.ends_with("..."));
    }
}
