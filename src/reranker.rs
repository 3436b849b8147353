//! C9 — Reranker: (query, candidates) -> reordered candidates. Optional;
//! failures fall soft (the query engine bypasses reranking rather than
//! failing the request).

use crate::errors::{RagError, RagResult};
use crate::llm_client::LlmClient;
use crate::reranking::cross_encoder::CrossEncoderReranker;
use std::collections::HashSet;
use std::sync::Arc;

pub struct RerankCandidate {
    pub id: i64,
    pub text: String,
}

/// `rerank` preserves every input candidate (by id) and returns scores;
/// callers merge the score back onto their own record so no input field is
/// lost. Scores need not be comparable across different queries.
#[async_trait::async_trait]
pub trait Reranker: Send + Sync {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
    ) -> RagResult<Vec<(i64, f32)>>;
}

/// Wraps the teacher's ONNX cross-encoder reranker. Runs on the blocking
/// pool since ONNX inference is CPU-bound and synchronous.
pub struct CrossEncoderRerankerAdapter {
    inner: Arc<CrossEncoderReranker>,
}

impl CrossEncoderRerankerAdapter {
    pub fn new(inner: CrossEncoderReranker) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait::async_trait]
impl Reranker for CrossEncoderRerankerAdapter {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
    ) -> RagResult<Vec<(i64, f32)>> {
        let inner = self.inner.clone();
        let query = query.to_string();
        let pairs: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (c.id.to_string(), c.text.clone()))
            .collect();

        let scored = tokio::task::spawn_blocking(move || inner.rerank(&query, &pairs, top_k))
            .await
            .map_err(|e| RagError::retrieval(format!("reranker task panicked: {e}")))?
            .map_err(|e| RagError::retrieval(format!("reranking failed: {e}")))?;

        Ok(scored
            .into_iter()
            .filter_map(|(id_str, score)| id_str.parse::<i64>().ok().map(|id| (id, score)))
            .collect())
    }
}

const MAX_RERANK_CANDIDATES: usize = 15;
const RERANK_SNIPPET_CHARS: usize = 300;
const RERANK_OUTPUT_TOKENS: usize = 256;
const RERANK_TIMEOUT_SECS: u64 = 20;

/// Listwise LLM reranker: one call judges relevance of every candidate
/// against the query and returns an order, rather than scoring pairs
/// independently like the cross-encoder. Falls back to the incoming
/// candidate order (reported as descending synthetic scores, so the query
/// engine's sort is a no-op) on any LLM failure, timeout, or unparseable
/// output.
pub struct LlmRerankerAdapter {
    llm: Arc<dyn LlmClient>,
}

impl LlmRerankerAdapter {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait::async_trait]
impl Reranker for LlmRerankerAdapter {
    async fn rerank(
        &self,
        query: &str,
        candidates: &[RerankCandidate],
        top_k: usize,
    ) -> RagResult<Vec<(i64, f32)>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        if candidates.len() == 1 {
            return Ok(vec![(candidates[0].id, 1.0)]);
        }

        let candidate_count = candidates.len().min(MAX_RERANK_CANDIDATES);
        let snippets: String = candidates
            .iter()
            .take(candidate_count)
            .enumerate()
            .map(|(i, c)| {
                let truncated: String = c.text.chars().take(RERANK_SNIPPET_CHARS).collect();
                format!("[{}] {}", i + 1, truncated)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "You are a search relevance judge. Given a user query and numbered document snippets, \
             rank the snippets by relevance to the query.\n\n\
             Query: \"{query}\"\n\n\
             Snippets:\n{snippets}\n\n\
             Return ONLY a JSON array of snippet numbers ordered from most relevant to least relevant. \
             Include ALL {candidate_count} snippet numbers. Example: [3, 1, 5, 2, 4]\n\
             Output ONLY the JSON array, nothing else."
        );

        let raw_output = match tokio::time::timeout(
            std::time::Duration::from_secs(RERANK_TIMEOUT_SECS),
            self.llm.generate(&prompt, RERANK_OUTPUT_TOKENS, 0.0),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "LLM reranking call failed, keeping candidate order");
                return Ok(truncate(fallback_scores(candidates), top_k));
            }
            Err(_) => {
                tracing::warn!("LLM reranking timed out, keeping candidate order");
                return Ok(truncate(fallback_scores(candidates), top_k));
            }
        };

        let scored = match parse_ranking(&raw_output, candidate_count) {
            Some(order) => scores_from_ranking(candidates, &order),
            None => {
                tracing::warn!(
                    output = %raw_output.chars().take(200).collect::<String>(),
                    "could not parse LLM reranking output, keeping candidate order"
                );
                fallback_scores(candidates)
            }
        };
        Ok(truncate(scored, top_k))
    }
}

/// Bounds reranked output to `top_k`, matching the cross-encoder adapter
/// (which already honors `top_k` via `CrossEncoderReranker::rerank`) so the
/// query engine's merge/threshold/rerank result size stays bounded
/// regardless of which reranker is wired up.
fn truncate(mut scored: Vec<(i64, f32)>, top_k: usize) -> Vec<(i64, f32)> {
    scored.truncate(top_k);
    scored
}

fn fallback_scores(candidates: &[RerankCandidate]) -> Vec<(i64, f32)> {
    let n = candidates.len() as f32;
    candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, (n - i as f32) / n))
        .collect()
}

/// Assigns descending synthetic scores from a 0-indexed ranking order; any
/// candidate not mentioned in `order` keeps its original relative position,
/// appended after all ranked candidates.
fn scores_from_ranking(candidates: &[RerankCandidate], order: &[usize]) -> Vec<(i64, f32)> {
    let mut used = HashSet::new();
    let mut ranked_ids: Vec<i64> = Vec::with_capacity(candidates.len());

    for &idx in order {
        if idx < candidates.len() && used.insert(idx) {
            ranked_ids.push(candidates[idx].id);
        }
    }
    for (i, c) in candidates.iter().enumerate() {
        if !used.contains(&i) {
            ranked_ids.push(c.id);
        }
    }

    let n = ranked_ids.len() as f32;
    ranked_ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, (n - i as f32) / n))
        .collect()
}

/// Parses a listwise LLM ranking response into a zero-indexed order.
/// Three-tier strategy: direct JSON parse, first `[...]` substring, then
/// digit extraction (accepted if at least half the expected indices recover).
fn parse_ranking(output: &str, expected_count: usize) -> Option<Vec<usize>> {
    let trimmed = output
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(indices) = serde_json::from_str::<Vec<usize>>(trimmed) {
        if validate_ranking(&indices, expected_count) {
            return Some(to_zero_indexed(indices));
        }
    }

    if let Some(start) = trimmed.find('[') {
        if let Some(end) = trimmed[start..].find(']') {
            let slice = &trimmed[start..=start + end];
            if let Ok(indices) = serde_json::from_str::<Vec<usize>>(slice) {
                if validate_ranking(&indices, expected_count) {
                    return Some(to_zero_indexed(indices));
                }
            }
        }
    }

    let numbers: Vec<usize> = trimmed
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|s| s.parse::<usize>().ok())
        .filter(|&n| n >= 1 && n <= expected_count)
        .collect();

    if numbers.len() >= (expected_count + 1) / 2 {
        let mut seen = HashSet::new();
        let deduped: Vec<usize> = numbers
            .into_iter()
            .filter(|n| seen.insert(*n))
            .map(|i| i.saturating_sub(1))
            .collect();
        if !deduped.is_empty() {
            return Some(deduped);
        }
    }

    None
}

fn validate_ranking(indices: &[usize], expected_count: usize) -> bool {
    !indices.is_empty() && indices.iter().all(|&i| i >= 1 && i <= expected_count)
}

fn to_zero_indexed(indices: Vec<usize>) -> Vec<usize> {
    indices.into_iter().map(|i| i.saturating_sub(1)).collect()
}

#[cfg(test)]
mod llm_reranker_tests {
    use super::*;
    use crate::errors::RagResult;

    struct StaticLlm(String);

    #[async_trait::async_trait]
    impl LlmClient for StaticLlm {
        async fn generate(&self, _prompt: &str, _max_tokens: usize, _temperature: f32) -> RagResult<String> {
            Ok(self.0.clone())
        }
    }

    fn candidates_n(n: usize) -> Vec<RerankCandidate> {
        (0..n as i64).map(|i| candidate(i, "text")).collect()
    }

    #[tokio::test]
    async fn rerank_truncates_to_top_k_on_success() {
        let llm: Arc<dyn LlmClient> = Arc::new(StaticLlm("[5, 4, 3, 2, 1]".to_string()));
        let reranker = LlmRerankerAdapter::new(llm);
        let candidates = candidates_n(5);
        let scored = reranker.rerank("q", &candidates, 2).await.unwrap();
        assert_eq!(scored.len(), 2);
    }

    #[tokio::test]
    async fn rerank_truncates_to_top_k_on_parse_failure() {
        let llm: Arc<dyn LlmClient> = Arc::new(StaticLlm("not a ranking at all".to_string()));
        let reranker = LlmRerankerAdapter::new(llm);
        let candidates = candidates_n(6);
        let scored = reranker.rerank("q", &candidates, 3).await.unwrap();
        assert_eq!(scored.len(), 3);
    }

    #[tokio::test]
    async fn rerank_truncates_to_top_k_on_llm_error() {
        struct FailingLlm;
        #[async_trait::async_trait]
        impl LlmClient for FailingLlm {
            async fn generate(&self, _p: &str, _m: usize, _t: f32) -> RagResult<String> {
                Err(RagError::llm("boom", None, None))
            }
        }
        let llm: Arc<dyn LlmClient> = Arc::new(FailingLlm);
        let reranker = LlmRerankerAdapter::new(llm);
        let candidates = candidates_n(4);
        let scored = reranker.rerank("q", &candidates, 2).await.unwrap();
        assert_eq!(scored.len(), 2);
    }

    #[test]
    fn parse_clean_json() {
        let result = parse_ranking("[3, 1, 2]", 3).unwrap();
        assert_eq!(result, vec![2, 0, 1]);
    }

    #[test]
    fn parse_json_with_fences() {
        let result = parse_ranking("```json\n[2, 1, 3]\n```", 3).unwrap();
        assert_eq!(result, vec![1, 0, 2]);
    }

    #[test]
    fn parse_json_with_surrounding_text() {
        let result = parse_ranking("Here is the ranking: [3, 1, 2] based on relevance.", 3).unwrap();
        assert_eq!(result, vec![2, 0, 1]);
    }

    #[test]
    fn parse_integer_extraction_fallback() {
        let result = parse_ranking("The order is: 3, then 1, then 2.", 3).unwrap();
        assert_eq!(result, vec![2, 0, 1]);
    }

    #[test]
    fn parse_garbage_returns_none() {
        assert!(parse_ranking("I don't understand what you want.", 5).is_none());
    }

    #[test]
    fn parse_partial_ranking_accepted_at_half() {
        let result = parse_ranking("[2, 4, 1]", 5).unwrap();
        assert_eq!(result, vec![1, 3, 0]);
    }

    fn candidate(id: i64, text: &str) -> RerankCandidate {
        RerankCandidate { id, text: text.to_string() }
    }

    #[test]
    fn scores_from_ranking_reorders() {
        let candidates = vec![candidate(1, "a"), candidate(2, "b"), candidate(3, "c")];
        let scores = scores_from_ranking(&candidates, &[2, 0, 1]);
        assert_eq!(scores[0].0, 3);
        assert_eq!(scores[1].0, 1);
        assert_eq!(scores[2].0, 2);
        assert!(scores[0].1 > scores[1].1 && scores[1].1 > scores[2].1);
    }

    #[test]
    fn scores_from_ranking_appends_unmentioned() {
        let candidates = vec![
            candidate(1, "a"),
            candidate(2, "b"),
            candidate(3, "c"),
            candidate(4, "d"),
        ];
        let scores = scores_from_ranking(&candidates, &[2, 0]);
        let ids: Vec<i64> = scores.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 1, 2, 4]);
    }
}
