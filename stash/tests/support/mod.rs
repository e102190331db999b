// Test doubles shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use stash::extraction::Extractor;
use stash::llm::summarizer::{GenerationParams, Summarizer};
use stash::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use stash::pipeline::Pipeline;
use stash::scraping::{FetchError, FetchOptions, HttpFetcher, PageFetcher, UrlPolicy};
use stash::storage::{DeleteOutcome, LinkRecord, LinkStore, NewLink, PrincipalId, SqliteLinkStore};
use url::Url;

pub enum FetchScript {
    Html(String),
    Refuse,
    Hang,
}

pub struct ScriptedFetcher {
    script: FetchScript,
    pub calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(script: FetchScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// A genuine connection-refused error from a port nobody listens on.
pub async fn refused_error() -> FetchError {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let fetcher = HttpFetcher::new(FetchOptions {
        timeout: Duration::from_secs(5),
        policy: UrlPolicy::allow_private(),
        ..FetchOptions::default()
    })
    .expect("fetcher");
    let url = Url::parse(&format!("http://127.0.0.1:{}/", port)).expect("url");
    fetcher.fetch(&url).await.expect_err("nothing listens on this port")
}

#[async_trait::async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch(&self, _url: &Url) -> Result<String, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            FetchScript::Html(html) => Ok(html.clone()),
            FetchScript::Refuse => Err(refused_error().await),
            FetchScript::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(String::new())
            }
        }
    }
}

pub enum ProviderScript {
    Reply(String),
    Fail(String),
    Hang,
}

pub struct ScriptedProvider {
    script: ProviderScript,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(script: ProviderScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn reply(text: &str) -> Arc<Self> {
        Self::new(ProviderScript::Reply(text.to_string()))
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().unwrap().last().cloned()
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn generate(&self, request: LlmRequest) -> anyhow::Result<LlmResponse> {
        self.prompts.lock().unwrap().push(request.prompt);
        match &self.script {
            ProviderScript::Reply(text) => Ok(LlmResponse {
                content: text.clone(),
                usage: UsageMetadata::default(),
                model: "scripted".to_string(),
            }),
            ProviderScript::Fail(reason) => anyhow::bail!("{}", reason),
            ProviderScript::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                anyhow::bail!("too late")
            }
        }
    }

    fn model(&self) -> &str {
        "scripted"
    }
}

/// In-memory store that counts inserts.
#[derive(Default)]
pub struct RecordingStore {
    links: Mutex<Vec<LinkRecord>>,
    inserts: AtomicUsize,
}

impl RecordingStore {
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LinkStore for RecordingStore {
    async fn insert(&self, link: NewLink) -> anyhow::Result<LinkRecord> {
        let id = self.inserts.fetch_add(1, Ordering::SeqCst) as i64 + 1;
        let record = LinkRecord {
            id,
            owner_id: link.owner,
            url: link.url,
            title: link.title,
            summary: link.summary,
            tags: link.tags,
            created_at: Utc::now(),
        };
        self.links.lock().unwrap().push(record.clone());
        Ok(record)
    }

    async fn list_by_owner(&self, owner: PrincipalId) -> anyhow::Result<Vec<LinkRecord>> {
        let mut links: Vec<LinkRecord> = self
            .links
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.owner_id == owner)
            .cloned()
            .collect();
        links.reverse();
        Ok(links)
    }

    async fn delete_by_owner_and_id(&self, owner: PrincipalId, id: i64) -> anyhow::Result<DeleteOutcome> {
        let mut links = self.links.lock().unwrap();
        let before = links.len();
        links.retain(|l| !(l.owner_id == owner && l.id == id));
        Ok(if links.len() < before {
            DeleteOutcome::Deleted
        } else {
            DeleteOutcome::NotFound
        })
    }
}

pub async fn sqlite_store() -> Arc<SqliteLinkStore> {
    let pool = common::init_memory_pool().await.expect("memory pool");
    common::run_migrations(&pool).await.expect("migrations");
    Arc::new(SqliteLinkStore::new(pool))
}

pub fn pipeline(
    fetcher: Arc<dyn PageFetcher>,
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn LinkStore>,
    deadline: Duration,
) -> Pipeline {
    let summarizer = Summarizer::new(provider, GenerationParams::default()).with_deadline(deadline);
    Pipeline::new(fetcher, Extractor::default(), summarizer, store)
}

pub fn article_html(title: &str, paragraphs: &[&str]) -> String {
    let body: String = paragraphs.iter().map(|p| format!("<p>{}</p>", p)).collect();
    format!(
        "<!doctype html><html><head><title>{}</title></head><body><nav><a href=\"/\">Home</a></nav>{}</body></html>",
        title, body
    )
}
