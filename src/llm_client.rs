//! C8 — LLM client: prompt -> completion, provider-agnostic, with a
//! per-call deadline and typed errors for missing credentials vs. transient
//! provider failures.

use crate::errors::{RagError, RagResult};
use crate::llm::{GenerationConfig, LLMProvider};
use std::sync::Arc;
use std::time::Duration;

#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, prompt: &str, max_tokens: usize, temperature: f32) -> RagResult<String>;
}

/// Adapts any `LLMProvider` implementation (the teacher's external-API
/// providers — OpenAI-compatible, Anthropic, etc.) to the C8 contract,
/// enforcing a deadline.
pub struct ProviderLlmClient {
    provider: Arc<dyn LLMProvider>,
    provider_name: String,
    model_name: String,
    deadline: Duration,
}

impl ProviderLlmClient {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        provider_name: impl Into<String>,
        model_name: impl Into<String>,
        deadline_secs: u64,
    ) -> Self {
        Self {
            provider,
            provider_name: provider_name.into(),
            model_name: model_name.into(),
            deadline: Duration::from_secs(deadline_secs),
        }
    }
}

#[async_trait::async_trait]
impl LlmClient for ProviderLlmClient {
    async fn generate(&self, prompt: &str, max_tokens: usize, temperature: f32) -> RagResult<String> {
        let config = GenerationConfig {
            max_tokens,
            temperature,
            top_p: 0.95,
            top_k: 40,
            repetition_penalty: 1.1,
            stop_sequences: Vec::new(),
            seed: None,
        };

        let provider = self.provider.clone();
        let prompt = prompt.to_string();

        match tokio::time::timeout(self.deadline, async move { provider.generate(&prompt, &config).await }).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(RagError::llm(
                format!("LLM generation failed: {e}"),
                Some(self.provider_name.clone()),
                Some(self.model_name.clone()),
            )),
            Err(_) => Err(RagError::llm(
                "LLM call exceeded its deadline",
                Some(self.provider_name.clone()),
                Some(self.model_name.clone()),
            )),
        }
    }
}

/// A disabled/no-op client used when no LLM is configured — the query
/// engine still surfaces sources, just without a synthesized answer.
pub struct DisabledLlmClient;

#[async_trait::async_trait]
impl LlmClient for DisabledLlmClient {
    async fn generate(&self, _prompt: &str, _max_tokens: usize, _temperature: f32) -> RagResult<String> {
        Err(RagError::configuration("no LLM provider configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_client_errors_as_configuration() {
        let client = DisabledLlmClient;
        let err = client.generate("hi", 10, 0.1).await.unwrap_err();
        assert_eq!(err.kind(), "configuration");
    }
}
