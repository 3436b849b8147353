//! C10 — Query enhancer: query -> intent + variants. Optional; the query
//! engine falls back to the unenhanced path if `enhance` fails or returns
//! nothing usable.

use crate::errors::RagResult;
use crate::rag::query_decomposer::decompose_query;
use crate::rag::query_rewriter::{ConversationContext, QueryRewriter};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone)]
pub struct Intent {
    pub intent_type: String,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct EnhancedQuery {
    pub intent: Intent,
    pub keywords: Vec<String>,
    pub expanded_queries: Vec<String>,
    pub reformulated_queries: Vec<String>,
}

pub trait QueryEnhancer: Send + Sync {
    fn enhance(&self, query: &str) -> RagResult<EnhancedQuery>;

    /// Query variants with confidence weights, highest confidence first.
    /// Always includes the original query at confidence 1.0.
    fn variants(&self, enhanced: &EnhancedQuery) -> Vec<(String, f32)>;
}

static GREETING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(hi|hello|hey|good (morning|afternoon|evening))\b").unwrap()
});
static GOODBYE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(bye|goodbye|see you|that's all|thanks,? bye)\b").unwrap()
});
static HELP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(help|what can you do|how do (i|you) use)\b").unwrap()
});
static COMPARISON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(versus|vs\.?|compare|difference between|better than)\b").unwrap()
});
static EXPLANATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(why|how does|how do|explain)\b").unwrap());
static QUESTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(what|who|when|where|which|is|are|does|do|can|could)\b|\?\s*$").unwrap()
});

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "was", "were", "you", "your", "with", "that", "this", "have",
    "has", "had", "not", "but", "can", "could", "what", "when", "where", "which", "who", "how",
    "why", "does", "do", "did", "from", "into", "about", "there", "their", "they", "them",
];

pub(crate) fn classify_intent(query: &str) -> Intent {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Intent {
            intent_type: "information_seeking".to_string(),
            confidence: 0.3,
        };
    }
    if GREETING_RE.is_match(trimmed) {
        return Intent {
            intent_type: "greeting".to_string(),
            confidence: 0.9,
        };
    }
    if GOODBYE_RE.is_match(trimmed) {
        return Intent {
            intent_type: "goodbye".to_string(),
            confidence: 0.9,
        };
    }
    if HELP_RE.is_match(trimmed) {
        return Intent {
            intent_type: "help".to_string(),
            confidence: 0.85,
        };
    }
    if COMPARISON_RE.is_match(trimmed) {
        return Intent {
            intent_type: "comparison".to_string(),
            confidence: 0.8,
        };
    }
    if EXPLANATION_RE.is_match(trimmed) {
        return Intent {
            intent_type: "explanation".to_string(),
            confidence: 0.75,
        };
    }
    if QUESTION_RE.is_match(trimmed) {
        return Intent {
            intent_type: "question".to_string(),
            confidence: 0.7,
        };
    }
    Intent {
        intent_type: "information_seeking".to_string(),
        confidence: 0.5,
    }
}

pub(crate) fn extract_keywords(query: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut keywords = Vec::new();
    for word in query.split_whitespace() {
        let cleaned: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if cleaned.len() < 3 || STOP_WORDS.contains(&cleaned.as_str()) {
            continue;
        }
        if seen.insert(cleaned.clone()) {
            keywords.push(cleaned);
        }
    }
    keywords
}

/// Wraps the teacher's rule-based query rewriter and decomposer. Pure,
/// synchronous, no network or model calls — so there is nothing to fail
/// soft *on* here, but callers still treat any error as non-fatal.
pub struct RuleBasedQueryEnhancer {
    rewriter: QueryRewriter,
}

impl Default for RuleBasedQueryEnhancer {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBasedQueryEnhancer {
    pub fn new() -> Self {
        Self {
            rewriter: QueryRewriter::new(),
        }
    }
}

impl QueryEnhancer for RuleBasedQueryEnhancer {
    fn enhance(&self, query: &str) -> RagResult<EnhancedQuery> {
        let intent = classify_intent(query);
        let keywords = extract_keywords(query);

        let context = ConversationContext::default();
        let rewritten = self.rewriter.rewrite_rule_based(query, &context);
        let expanded_queries = self.rewriter.expand_query(query, &context);

        let decomposed = decompose_query(query);
        let mut reformulated_queries = decomposed.sub_queries.clone();
        if rewritten.rewritten != query {
            reformulated_queries.push(rewritten.rewritten.clone());
        }
        reformulated_queries.retain(|q| !q.trim().is_empty() && q.trim() != query.trim());

        Ok(EnhancedQuery {
            intent,
            keywords,
            expanded_queries,
            reformulated_queries,
        })
    }

    fn variants(&self, enhanced: &EnhancedQuery) -> Vec<(String, f32)> {
        let mut variants = Vec::new();
        let mut seen = std::collections::HashSet::new();

        let mut push = |text: String, confidence: f32| {
            let key = text.trim().to_lowercase();
            if !key.is_empty() && seen.insert(key) {
                variants.push((text, confidence));
            }
        };

        for q in &enhanced.reformulated_queries {
            push(q.clone(), 0.9);
        }
        for q in &enhanced.expanded_queries {
            push(q.clone(), 0.6);
        }

        variants.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        variants.truncate(2);
        variants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_greeting_and_goodbye() {
        assert_eq!(classify_intent("hello there").intent_type, "greeting");
        assert_eq!(classify_intent("thanks, bye").intent_type, "goodbye");
    }

    #[test]
    fn classifies_question_by_default_for_wh_words() {
        assert_eq!(classify_intent("what is the refund policy?").intent_type, "question");
    }

    #[test]
    fn extract_keywords_drops_stop_words_and_short_tokens() {
        let keywords = extract_keywords("what is the policy for a refund");
        assert!(keywords.contains(&"policy".to_string()));
        assert!(keywords.contains(&"refund".to_string()));
        assert!(!keywords.contains(&"the".to_string()));
        assert!(!keywords.contains(&"for".to_string()));
    }

    #[test]
    fn variants_always_include_original_confidence_and_cap_at_two() {
        let enhancer = RuleBasedQueryEnhancer::new();
        let enhanced = EnhancedQuery {
            intent: Intent {
                intent_type: "question".to_string(),
                confidence: 0.7,
            },
            keywords: vec!["refund".to_string()],
            expanded_queries: vec!["refund policy details".to_string(), "refund eligibility".to_string()],
            reformulated_queries: vec!["what is the refund policy".to_string()],
        };
        let variants = enhancer.variants(&enhanced);
        assert!(variants.len() <= 2);
        assert!(variants.iter().any(|(_, c)| (*c - 0.9).abs() < 1e-6));
    }
}
