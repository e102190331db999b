use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_LOCATION: &str = "us-central1";

/// `generateContent` URL for a publisher model in a Vertex AI project.
pub fn vertex_endpoint(project: &str, location: &str, model: &str) -> String {
    format!(
        "https://{location}-aiplatform.googleapis.com/v1/projects/{project}/locations/{location}/publishers/google/models/{model}:generateContent"
    )
}

/// Vertex AI (Gemini) provider.
///
/// Authenticates with an OAuth access token passed in at construction; the
/// provider holds no process-wide credentials.
pub struct VertexProvider {
    endpoint: String,
    access_token: Option<String>,
    model: String,
    default_timeout: Duration,
    client: reqwest::Client,
}

impl VertexProvider {
    pub fn new(
        endpoint: impl Into<String>,
        access_token: Option<String>,
        model: impl Into<String>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client for Vertex AI")?;

        Ok(Self {
            endpoint: endpoint.into(),
            access_token,
            model: model.into(),
            default_timeout,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait::async_trait]
impl LlmProvider for VertexProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: request.prompt,
                }],
            }],
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
            },
        };

        tracing::debug!("Sending Vertex AI request to: {}", self.endpoint);

        let mut builder = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.access_token {
            builder = builder.bearer_auth(token);
        }

        let response = tokio::time::timeout(timeout, builder.send())
            .await
            .context("Vertex AI request timed out")?
            .context("Vertex AI HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Vertex AI error {}: {}", status, text);
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .context("Failed to parse Vertex AI response")?;

        let candidate = parsed
            .candidates
            .first()
            .context("Vertex AI response has no candidates")?;

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            anyhow::bail!("Content blocked by Vertex AI safety filters");
        }

        let parts = candidate
            .content
            .as_ref()
            .map(|c| c.parts.as_slice())
            .unwrap_or_default();
        if parts.is_empty() {
            anyhow::bail!("Vertex AI candidate has no content parts");
        }
        let text: String = parts.iter().filter_map(|p| p.text.as_deref()).collect();

        let usage = parsed
            .usage_metadata
            .map(|u| UsageMetadata {
                prompt_tokens: u.prompt_token_count.unwrap_or(0),
                completion_tokens: u.candidates_token_count.unwrap_or(0),
                total_tokens: u.total_token_count.unwrap_or(0),
            })
            .unwrap_or_default();

        Ok(LlmResponse {
            content: text,
            usage,
            model: parsed.model_version.unwrap_or_else(|| self.model.clone()),
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageCounts>,
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageCounts {
    prompt_token_count: Option<usize>,
    candidates_token_count: Option<usize>,
    total_token_count: Option<usize>,
}
