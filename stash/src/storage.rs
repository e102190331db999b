use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info};

/// Authenticated identity that owns links.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(pub i64);

impl std::fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored link. Immutable once written; only deletion is supported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkRecord {
    pub id: i64,
    #[serde(skip_serializing)]
    pub owner_id: PrincipalId,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields supplied by the pipeline; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewLink {
    pub owner: PrincipalId,
    pub url: String,
    pub title: String,
    pub summary: String,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Persistence collaborator for links. Every query is scoped to an owner.
#[async_trait]
pub trait LinkStore: Send + Sync {
    async fn insert(&self, link: NewLink) -> Result<LinkRecord>;

    /// Newest first.
    async fn list_by_owner(&self, owner: PrincipalId) -> Result<Vec<LinkRecord>>;

    async fn delete_by_owner_and_id(&self, owner: PrincipalId, id: i64) -> Result<DeleteOutcome>;
}

pub struct SqliteLinkStore {
    pool: SqlitePool,
}

impl SqliteLinkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LinkRow {
    id: i64,
    user_id: i64,
    url: String,
    title: String,
    summary: String,
    tags_json: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<LinkRow> for LinkRecord {
    type Error = anyhow::Error;

    fn try_from(row: LinkRow) -> Result<Self> {
        let tags: Vec<String> = serde_json::from_str(&row.tags_json)
            .with_context(|| format!("invalid tags_json for link {}", row.id))?;
        Ok(LinkRecord {
            id: row.id,
            owner_id: PrincipalId(row.user_id),
            url: row.url,
            title: row.title,
            summary: row.summary,
            tags,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl LinkStore for SqliteLinkStore {
    async fn insert(&self, link: NewLink) -> Result<LinkRecord> {
        let tags_json = serde_json::to_string(&link.tags).context("failed to serialize tags")?;
        let created_at = Utc::now();

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO links (user_id, url, title, summary, tags_json, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(link.owner.0)
        .bind(&link.url)
        .bind(&link.title)
        .bind(&link.summary)
        .bind(&tags_json)
        .bind(created_at)
        .fetch_one(&self.pool)
        .await
        .context("failed to insert link")?;

        info!("Stored link {} for owner {}", id, link.owner);
        Ok(LinkRecord {
            id,
            owner_id: link.owner,
            url: link.url,
            title: link.title,
            summary: link.summary,
            tags: link.tags,
            created_at,
        })
    }

    async fn list_by_owner(&self, owner: PrincipalId) -> Result<Vec<LinkRecord>> {
        let rows = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT id, user_id, url, title, summary, tags_json, created_at
            FROM links
            WHERE user_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(owner.0)
        .fetch_all(&self.pool)
        .await
        .context("failed to list links")?;

        debug!("Loaded {} links for owner {}", rows.len(), owner);
        rows.into_iter().map(LinkRecord::try_from).collect()
    }

    async fn delete_by_owner_and_id(&self, owner: PrincipalId, id: i64) -> Result<DeleteOutcome> {
        let result = sqlx::query("DELETE FROM links WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(owner.0)
            .execute(&self.pool)
            .await
            .context("failed to delete link")?;

        if result.rows_affected() == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            info!("Deleted link {} for owner {}", id, owner);
            Ok(DeleteOutcome::Deleted)
        }
    }
}
