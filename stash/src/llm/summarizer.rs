// Summarization client
use common::GenerationConfig;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::{LlmProvider, LlmRequest};

const DEFAULT_DEADLINE_SECS: u64 = 90;

/// Decoding parameters for summarization calls. Low temperature keeps output
/// close to deterministic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_output_tokens: 2048,
            temperature: 0.2,
            top_p: 0.8,
            top_k: 40,
        }
    }
}

impl GenerationParams {
    pub fn from_config(cfg: &GenerationConfig) -> Self {
        let defaults = Self::default();
        Self {
            max_output_tokens: cfg.max_output_tokens.unwrap_or(defaults.max_output_tokens),
            temperature: cfg.temperature.unwrap_or(defaults.temperature),
            top_p: cfg.top_p.unwrap_or(defaults.top_p),
            top_k: cfg.top_k.unwrap_or(defaults.top_k),
        }
    }
}

/// The model call failed or returned nothing usable. Never shown to users;
/// the pipeline swaps in a placeholder summary.
#[derive(Debug, Error)]
#[error("summarization unavailable: {reason}")]
pub struct SummarizationUnavailable {
    pub reason: String,
}

impl SummarizationUnavailable {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Prompt asking for a JSON object with `summary` and `tags`.
pub fn build_prompt(title: &str, body: &str) -> String {
    format!(
        r#"Task: Summarize the following article and generate relevant tags.

Article Title: {title}
Article Content:
{body}

Output Format (JSON):
{{
    "summary": "Concise summary of the article...",
    "tags": ["tag1", "tag2", "tag3"]
}}
"#
    )
}

pub struct Summarizer {
    provider: Arc<dyn LlmProvider>,
    params: GenerationParams,
    deadline: Duration,
}

impl Summarizer {
    pub fn new(provider: Arc<dyn LlmProvider>, params: GenerationParams) -> Self {
        Self {
            provider,
            params,
            deadline: Duration::from_secs(DEFAULT_DEADLINE_SECS),
        }
    }

    /// Upper bound on one model call; expiry counts as unavailable.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Send the article to the model and return its raw text.
    pub async fn summarize(&self, title: &str, body: &str) -> Result<String, SummarizationUnavailable> {
        let request = LlmRequest {
            prompt: build_prompt(title, body),
            max_tokens: Some(self.params.max_output_tokens),
            temperature: Some(self.params.temperature),
            top_p: Some(self.params.top_p),
            top_k: Some(self.params.top_k),
            timeout_seconds: None,
        };

        let response = match tokio::time::timeout(self.deadline, self.provider.generate(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!("LLM summarization failed ({}): {:#}", self.provider.model(), e);
                return Err(SummarizationUnavailable::new(format!("{:#}", e)));
            }
            Err(_) => {
                warn!("LLM summarization exceeded deadline of {:?}", self.deadline);
                return Err(SummarizationUnavailable::new(format!(
                    "no response within {:?}",
                    self.deadline
                )));
            }
        };

        if response.content.trim().is_empty() {
            warn!("LLM returned an empty completion ({})", response.model);
            return Err(SummarizationUnavailable::new("empty completion"));
        }

        info!(
            "LLM summarization successful: {} chars, {} tokens ({})",
            response.content.len(),
            response.usage.total_tokens,
            response.model
        );
        Ok(response.content)
    }
}
