/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Stash.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a default and an override config file
- Helpers to initialize and migrate an SQLite database
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

pub const DEFAULT_CONFIG_FILE: &str = "config.default.toml";
pub const LOCAL_CONFIG_FILE: &str = "config.toml";

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/stash.db")
    pub path: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

/// Page fetching configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
    pub max_response_bytes: Option<u64>,
    /// URL schemes the fetcher may request (defaults to http + https)
    pub allowed_schemes: Option<Vec<String>>,
    /// Refuse hosts that resolve to loopback/private/link-local addresses
    pub block_private_networks: Option<bool>,
    /// Hosts exempt from the private-network block
    pub allowed_hosts: Option<Vec<String>>,
}

/// Text extraction tuning
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Paragraphs whose trimmed length is at or below this are dropped
    pub min_paragraph_chars: Option<usize>,
    /// Extracted body is cut to this many characters
    pub max_body_chars: Option<usize>,
}

/// Vertex AI config (used if `llm.adapter = "vertex"`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VertexConfig {
    pub project: Option<String>,
    pub location: Option<String>,
    pub model: Option<String>,
    /// Full `generateContent` URL; derived from project/location/model when absent
    pub api_url: Option<String>,
    /// Name of the env var holding an OAuth access token
    pub access_token_env: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// OpenAI-compatible endpoint config (used if `llm.adapter = "remote"`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
}

/// Decoding parameters sent with every summarization call
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_output_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
}

/// LLM top-level config grouping provider specifics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "vertex", "remote"
    /// Upper bound on a single model call, including provider retries/timeouts
    pub deadline_seconds: Option<u64>,
    pub vertex: Option<VertexConfig>,
    pub remote: Option<RemoteLlmConfig>,
    pub generation: Option<GenerationConfig>,
}

/// Principal token settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Name of the env var holding the HS256 signing secret
    pub jwt_secret_env: Option<String>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: Option<ServerConfig>,
    pub fetch: Option<FetchConfig>,
    pub extraction: Option<ExtractionConfig>,
    pub llm: Option<LlmConfig>,
    pub auth: Option<AuthConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    /// Standard lookup: `config.default.toml` merged with `explicit` (which must
    /// exist when given) or else `config.toml` from the working directory.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);
        let override_path = match explicit {
            Some(p) if !p.exists() => {
                anyhow::bail!("Config file not found: {}", p.display());
            }
            Some(p) => Some(p),
            None => Some(Path::new(LOCAL_CONFIG_FILE)),
        };
        Self::load_with_defaults(Some(default_path), override_path).await
    }

    /// The `[server]` section, or an empty one.
    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn fetch(&self) -> FetchConfig {
        self.fetch.clone().unwrap_or_default()
    }

    pub fn extraction(&self) -> ExtractionConfig {
        self.extraction.clone().unwrap_or_default()
    }

    pub fn llm(&self) -> LlmConfig {
        self.llm.clone().unwrap_or_default()
    }

    pub fn auth(&self) -> AuthConfig {
        self.auth.clone().unwrap_or_default()
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Run SQL migrations embedded from the workspace `migrations` directory.
///
/// Accepts a pool rather than a path so callers (main, tests with in-memory
/// databases) decide how the connection is made.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("../migrations")
        .run(pool)
        .await
        .context("Failed to run sqlx migrations")?;

    Ok(())
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`.
///
/// Example:
///   let pool = init_db_pool("data/stash.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_context(|| {
                format!("Failed to create DB parent directory: {}", parent.display())
            })?;
        }
    }

    // Create the file up front so permission problems surface with a clear path.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

/// Single-connection in-memory pool; every connection of a `:memory:` pool
/// would otherwise see its own empty database.
pub async fn init_memory_pool() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory sqlite database")?;
    Ok(pool)
}
