use anyhow::{Context, Result};
use common::LlmConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod normalizer;
pub mod remote;
pub mod summarizer;
pub mod vertex;

/// Placeholder summary stored when the model cannot be reached.
pub const UNAVAILABLE_SUMMARY: &str = "AI Summarization unavailable.";
/// Tag stored alongside [`UNAVAILABLE_SUMMARY`].
pub const UNAVAILABLE_TAG: &str = "article";

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Core trait for generative text backends
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// Model identifier, for logs
    fn model(&self) -> &str;
}

/// Request structure for LLM generation
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// Summary and tags for a saved link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl SummaryResult {
    /// Stand-in used when the model call failed outright.
    pub fn unavailable() -> Self {
        Self {
            summary: UNAVAILABLE_SUMMARY.to_string(),
            tags: vec![UNAVAILABLE_TAG.to_string()],
        }
    }

    /// Model text kept as-is because it was not a summary object.
    pub fn raw_text(text: impl Into<String>) -> Self {
        Self {
            summary: text.into(),
            tags: Vec::new(),
        }
    }
}

/// Which fallback tier produced a [`SummaryResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryFidelity {
    Structured,
    RawText,
    Unavailable,
}

impl std::fmt::Display for SummaryFidelity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SummaryFidelity::Structured => "structured",
            SummaryFidelity::RawText => "raw_text",
            SummaryFidelity::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Build the provider selected by `llm.adapter` (default: vertex).
pub fn create_llm_provider(llm_config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("vertex");
    match adapter {
        "vertex" => {
            let cfg = llm_config.vertex.clone().unwrap_or_default();
            let token_env = cfg
                .access_token_env
                .clone()
                .unwrap_or_else(|| "GOOGLE_OAUTH_ACCESS_TOKEN".to_string());
            let access_token = std::env::var(&token_env).ok();
            if access_token.is_none() {
                warn!("Vertex access token env var '{}' not set; requests will be unauthenticated", token_env);
            }

            let model = cfg.model.unwrap_or_else(|| vertex::DEFAULT_MODEL.to_string());
            let endpoint = match cfg.api_url {
                Some(url) => url,
                None => {
                    let project = cfg
                        .project
                        .context("llm.vertex.project is required when llm.vertex.api_url is not set")?;
                    let location = cfg
                        .location
                        .unwrap_or_else(|| vertex::DEFAULT_LOCATION.to_string());
                    vertex::vertex_endpoint(&project, &location, &model)
                }
            };

            let provider = vertex::VertexProvider::new(
                endpoint,
                access_token,
                model,
                Duration::from_secs(cfg.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            )?;
            info!("LLM provider initialized: vertex ({}) at {}", provider.model(), provider.endpoint());
            Ok(Arc::new(provider))
        }
        "remote" => {
            let cfg = llm_config
                .remote
                .clone()
                .context("Remote adapter selected but no [llm.remote] section found")?;
            let api_key_env = cfg
                .api_key_env
                .as_deref()
                .context("Missing api_key_env in remote config")?;
            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;
            let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let api_url = cfg
                .api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());

            let provider = remote::RemoteLlmProvider::new(&api_url, api_key, &model)
                .with_timeout(cfg.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS));
            info!("LLM provider initialized: remote ({}) at {}", model, api_url);
            Ok(Arc::new(provider))
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}
