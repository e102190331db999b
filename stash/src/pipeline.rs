//! Link ingestion: fetch → extract → summarize → normalize → persist.
//!
//! Only the fetch stage can fail an ingestion. Once a page has been fetched
//! the link is always stored; model problems only lower the quality of the
//! summary (structured → raw text → fixed placeholder).

use anyhow::Context;
use common::Config;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::extraction::Extractor;
use crate::llm::normalizer::normalize_with_fidelity;
use crate::llm::summarizer::{GenerationParams, Summarizer};
use crate::llm::{self, SummaryFidelity, SummaryResult};
use crate::scraping::{self, FetchError, FetchOptions, HttpFetcher, PageFetcher};
use crate::storage::{LinkRecord, LinkStore, NewLink, PrincipalId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Fetching,
    Extracting,
    Summarizing,
    Normalizing,
    Persisting,
    Done,
    Failed,
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IngestStage::Fetching => "fetching",
            IngestStage::Extracting => "extracting",
            IngestStage::Summarizing => "summarizing",
            IngestStage::Normalizing => "normalizing",
            IngestStage::Persisting => "persisting",
            IngestStage::Done => "done",
            IngestStage::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("failed to fetch page: {0}")]
    Fetch(#[from] FetchError),
    #[error("ingestion cancelled while {stage}")]
    Cancelled { stage: IngestStage },
    #[error("failed to store link: {0:#}")]
    Storage(anyhow::Error),
}

pub struct Pipeline {
    fetcher: Arc<dyn PageFetcher>,
    extractor: Extractor,
    summarizer: Summarizer,
    store: Arc<dyn LinkStore>,
}

impl Pipeline {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        extractor: Extractor,
        summarizer: Summarizer,
        store: Arc<dyn LinkStore>,
    ) -> Self {
        Self {
            fetcher,
            extractor,
            summarizer,
            store,
        }
    }

    /// Wire the HTTP fetcher, extractor and configured model provider around `store`.
    pub fn from_config(config: &Config, store: Arc<dyn LinkStore>) -> anyhow::Result<Self> {
        let fetcher = HttpFetcher::new(FetchOptions::from_config(&config.fetch()))
            .context("failed to build page fetcher")?;

        let llm_config = config.llm();
        let provider = llm::create_llm_provider(&llm_config)?;
        let params = llm_config
            .generation
            .as_ref()
            .map(GenerationParams::from_config)
            .unwrap_or_default();
        let mut summarizer = Summarizer::new(provider, params);
        if let Some(secs) = llm_config.deadline_seconds {
            summarizer = summarizer.with_deadline(Duration::from_secs(secs));
        }

        Ok(Self::new(
            Arc::new(fetcher),
            Extractor::from_config(&config.extraction()),
            summarizer,
            store,
        ))
    }

    pub fn store(&self) -> Arc<dyn LinkStore> {
        self.store.clone()
    }

    /// Ingest `url` on behalf of `owner`, returning the stored record.
    ///
    /// Nothing is stored when the fetch fails or `cancel` fires before the
    /// insert starts.
    pub async fn ingest(
        &self,
        url: &str,
        owner: PrincipalId,
        cancel: &CancellationToken,
    ) -> Result<LinkRecord, IngestError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest", %run_id, url = %url, owner = %owner);
        self.run(url, owner, cancel).instrument(span).await
    }

    async fn run(
        &self,
        url: &str,
        owner: PrincipalId,
        cancel: &CancellationToken,
    ) -> Result<LinkRecord, IngestError> {
        debug!(stage = %IngestStage::Fetching);
        let html = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(IngestError::Cancelled { stage: IngestStage::Fetching });
            }
            fetched = self.fetch(url) => match fetched {
                Ok(html) => html,
                Err(e) => {
                    error!(stage = %IngestStage::Failed, "fetch failed: {}", e);
                    return Err(e.into());
                }
            },
        };

        debug!(stage = %IngestStage::Extracting);
        let document = self.extractor.extract(url, &html);
        drop(html);
        info!(
            "extracted title {:?} and {} body chars",
            document.title,
            document.body.chars().count()
        );

        debug!(stage = %IngestStage::Summarizing);
        let model_text = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(IngestError::Cancelled { stage: IngestStage::Summarizing });
            }
            text = self.summarizer.summarize(&document.title, &document.body) => text,
        };

        debug!(stage = %IngestStage::Normalizing);
        let (summary, fidelity) = match model_text {
            Ok(text) => normalize_with_fidelity(&text),
            Err(e) => {
                warn!("using placeholder summary: {}", e);
                (SummaryResult::unavailable(), SummaryFidelity::Unavailable)
            }
        };

        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled {
                stage: IngestStage::Persisting,
            });
        }

        debug!(stage = %IngestStage::Persisting);
        let record = self
            .store
            .insert(NewLink {
                owner,
                url: url.to_string(),
                title: document.title,
                summary: summary.summary,
                tags: summary.tags,
            })
            .await
            .map_err(IngestError::Storage)?;

        info!(stage = %IngestStage::Done, link_id = record.id, %fidelity, "link ingested");
        Ok(record)
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let target = scraping::parse_target(url)?;
        self.fetcher.fetch(&target).await
    }
}
