//! C5 — Chunker: text -> ordered sequence of chunks with positional
//! metadata. Two strategies: size-based (sentence-boundary packing with
//! character overlap) and semantic (sentence-embedding boundary detection
//! with a size-based fallback).

use crate::embedder::Embedder;
use serde_json::{Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub chunk_index: usize,
    pub metadata: Map<String, Value>,
}

/// Splits `text` on sentence boundaries, greedily packing sentences into
/// chunks of at most `chunk_size` characters, carrying `chunk_overlap`
/// characters of tail into the next chunk. Never splits a sentence.
pub struct SizeBasedChunker {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl SizeBasedChunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return Vec::new();
        }

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut carried_overlap = String::new();

        for sentence in &sentences {
            let candidate_len = current.len() + sentence.len() + 1;
            if !current.is_empty() && candidate_len > self.chunk_size {
                chunks.push(finish_chunk(&current, chunks.len()));
                carried_overlap = tail_chars(&current, self.chunk_overlap);
                current = carried_overlap.clone();
            }
            if !current.is_empty() && !current.ends_with(' ') {
                current.push(' ');
            }
            current.push_str(sentence);
        }

        if !current.trim().is_empty() && current.trim() != carried_overlap.trim() {
            chunks.push(finish_chunk(&current, chunks.len()));
        }

        chunks
    }
}

fn finish_chunk(text: &str, index: usize) -> Chunk {
    let mut metadata = Map::new();
    metadata.insert("chunking_method".to_string(), Value::String("size_based".to_string()));
    Chunk {
        text: text.trim().to_string(),
        chunk_index: index,
        metadata,
    }
}

fn tail_chars(s: &str, n: usize) -> String {
    if s.len() <= n {
        return s.to_string();
    }
    let start = s.len() - n;
    let snapped = (start..=s.len()).find(|&i| s.is_char_boundary(i)).unwrap_or(s.len());
    s[snapped..].to_string()
}

/// Naive sentence splitter: breaks on `.`/`!`/`?` followed by whitespace,
/// preserving the terminator. Good enough for chunk-boundary purposes; does
/// not attempt full NLP sentence segmentation.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            let next_is_boundary = chars
                .peek()
                .map(|n| n.is_whitespace())
                .unwrap_or(true);
            if next_is_boundary {
                let trimmed = current.trim();
                if !trimmed.is_empty() {
                    sentences.push(trimmed.to_string());
                }
                current.clear();
            }
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    sentences
}

/// Embeds each sentence and places a boundary wherever consecutive-sentence
/// cosine similarity drops below `similarity_threshold`, respecting
/// `max_chunk_size`. Falls back to size-based chunking (stamping
/// `chunking_method = "fallback"`) when the embedder is unavailable.
pub struct SemanticChunker {
    embedder: Option<Arc<dyn Embedder>>,
    similarity_threshold: f32,
    max_chunk_size: usize,
    fallback: SizeBasedChunker,
}

impl SemanticChunker {
    pub fn new(
        embedder: Option<Arc<dyn Embedder>>,
        similarity_threshold: f32,
        max_chunk_size: usize,
        chunk_overlap: usize,
    ) -> Self {
        Self {
            embedder,
            similarity_threshold,
            max_chunk_size,
            fallback: SizeBasedChunker::new(max_chunk_size, chunk_overlap),
        }
    }

    pub async fn chunk(&self, text: &str) -> Vec<Chunk> {
        let Some(embedder) = &self.embedder else {
            return self.chunk_with_fallback(text);
        };

        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return Vec::new();
        }

        let embeddings = match embedder.embed_texts(&sentences).await {
            Ok(v) => v,
            Err(_) => return self.chunk_with_fallback(text),
        };

        let mut chunks = Vec::new();
        let mut current = String::new();
        let mut index = 0;

        for (i, sentence) in sentences.iter().enumerate() {
            let would_exceed = current.len() + sentence.len() > self.max_chunk_size;
            let boundary = if i == 0 || current.is_empty() {
                false
            } else {
                cosine(&embeddings[i - 1], &embeddings[i]) < self.similarity_threshold
            };

            if !current.is_empty() && (boundary || would_exceed) {
                chunks.push(semantic_chunk(&current, index));
                index += 1;
                current.clear();
            }

            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);
        }
        if !current.trim().is_empty() {
            chunks.push(semantic_chunk(&current, index));
        }
        chunks
    }

    fn chunk_with_fallback(&self, text: &str) -> Vec<Chunk> {
        self.fallback
            .chunk(text)
            .into_iter()
            .map(|mut c| {
                c.metadata
                    .insert("chunking_method".to_string(), Value::String("fallback".to_string()));
                c
            })
            .collect()
    }
}

fn semantic_chunk(text: &str, index: usize) -> Chunk {
    let mut metadata = Map::new();
    metadata.insert("chunking_method".to_string(), Value::String("semantic".to_string()));
    Chunk {
        text: text.trim().to_string(),
        chunk_index: index,
        metadata,
    }
}

/// Selects between the two chunking strategies of §4.3, so the ingestion
/// engine can be configured with either without matching on a strategy enum
/// at every call site.
pub enum DocumentChunker {
    SizeBased(SizeBasedChunker),
    Semantic(SemanticChunker),
}

impl DocumentChunker {
    pub async fn chunk(&self, text: &str) -> Vec<Chunk> {
        match self {
            DocumentChunker::SizeBased(c) => c.chunk(text),
            DocumentChunker::Semantic(c) => c.chunk(text).await,
        }
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_based_never_splits_a_sentence() {
        let chunker = SizeBasedChunker::new(30, 5);
        let text = "Paris is the capital of France. Berlin is the capital of Germany. Rome is the capital of Italy.";
        let chunks = chunker.chunk(text);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.ends_with('.') || c.text == chunks.last().unwrap().text);
        }
    }

    #[test]
    fn chunk_indices_are_contiguous_from_zero() {
        let chunker = SizeBasedChunker::new(20, 2);
        let chunks = chunker.chunk("One sentence. Two sentence. Three sentence. Four sentence.");
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
        }
    }

    #[tokio::test]
    async fn semantic_chunker_falls_back_without_embedder() {
        let chunker = SemanticChunker::new(None, 0.6, 50, 5);
        let chunks = chunker.chunk("Hello world. This is a test sentence that is long enough.").await;
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert_eq!(
                c.metadata.get("chunking_method").and_then(|v| v.as_str()),
                Some("fallback")
            );
        }
    }
}
