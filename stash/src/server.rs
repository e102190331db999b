use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use common::Config;
use rocket::fairing::AdHoc;
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{catch, catchers, delete, get, post, routes, Build, Rocket, State};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthUser, TokenKeys};
use crate::pipeline::{IngestError, Pipeline};
use crate::storage::{DeleteOutcome, LinkRecord, LinkStore};

/// Application state stored inside Rocket managed state.
pub struct AppState {
    pub started_at: DateTime<Utc>,
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<dyn LinkStore>,
    /// Parent of every per-request ingestion token; cancelled at shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self {
            started_at: Utc::now(),
            store: pipeline.store(),
            pipeline,
            shutdown: CancellationToken::new(),
        }
    }
}

type ApiError = (Status, Json<Value>);

fn api_error(status: Status, message: &str) -> ApiError {
    (status, Json(json!({ "error": message })))
}

/// Request body for saving a link.
#[derive(Deserialize)]
struct CreateLink {
    url: Option<String>,
}

#[get("/")]
async fn index() -> &'static str {
    "Link Summarizer API is running"
}

#[get("/health")]
async fn health() -> &'static str {
    "OK"
}

#[get("/api/status")]
async fn status(state: &State<AppState>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Json(json!({ "status": "ok", "uptime_seconds": uptime }))
}

/// List the caller's links, newest first.
#[get("/api/links")]
async fn list_links(
    state: &State<AppState>,
    user: AuthUser,
) -> Result<Json<Vec<LinkRecord>>, ApiError> {
    state
        .store
        .list_by_owner(user.0)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("failed to list links for {}: {:#}", user.0, e);
            api_error(Status::InternalServerError, "Database error")
        })
}

/// Fetch, summarize and store a link for the caller.
#[post("/api/links", data = "<body>")]
async fn create_link(
    state: &State<AppState>,
    user: AuthUser,
    body: Json<CreateLink>,
) -> Result<Json<LinkRecord>, ApiError> {
    let url = match body.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => url.to_string(),
        _ => return Err(api_error(Status::BadRequest, "URL is required")),
    };

    let cancel = state.shutdown.child_token();
    match state.pipeline.ingest(&url, user.0, &cancel).await {
        Ok(record) => Ok(Json(record)),
        Err(e) => {
            let status = match e {
                IngestError::Cancelled { .. } => Status::ServiceUnavailable,
                IngestError::Fetch(_) | IngestError::Storage(_) => Status::InternalServerError,
            };
            tracing::error!("ingestion of {} failed: {}", url, e);
            Err((
                status,
                Json(json!({ "error": "Processing failed", "details": e.to_string() })),
            ))
        }
    }
}

#[delete("/api/links/<id>")]
async fn delete_link(
    state: &State<AppState>,
    user: AuthUser,
    id: i64,
) -> Result<Json<Value>, ApiError> {
    let outcome = state
        .store
        .delete_by_owner_and_id(user.0, id)
        .await
        .map_err(|e| {
            tracing::error!("failed to delete link {}: {:#}", id, e);
            api_error(Status::InternalServerError, "Database error")
        })?;

    match outcome {
        DeleteOutcome::Deleted => Ok(Json(json!({ "success": true }))),
        DeleteOutcome::NotFound => Err(api_error(Status::NotFound, "Link not found")),
    }
}

#[catch(401)]
fn unauthorized() -> Json<Value> {
    Json(json!({ "error": "You must log in!" }))
}

/// Body that is not JSON at all.
#[catch(400)]
fn bad_request() -> Json<Value> {
    Json(json!({ "error": "Invalid request body" }))
}

/// JSON of the wrong shape, e.g. a non-string `url`.
#[catch(422)]
fn unprocessable() -> Json<Value> {
    Json(json!({ "error": "Invalid request body" }))
}

/// Assemble the Rocket instance without binding a listener (used by tests).
pub fn build_rocket(figment: rocket::figment::Figment, state: AppState, keys: TokenKeys) -> Rocket<Build> {
    let shutdown = state.shutdown.clone();
    rocket::custom(figment)
        .manage(state)
        .manage(keys)
        .mount(
            "/",
            routes![index, health, status, list_links, create_link, delete_link],
        )
        .register("/", catchers![unauthorized, bad_request, unprocessable])
        .attach(AdHoc::on_shutdown("Cancel ingestions", move |_| {
            Box::pin(async move {
                tracing::info!("shutdown: cancelling in-flight ingestions");
                shutdown.cancel();
            })
        }))
}

/// Build and launch the Rocket server.
///
/// Bind address and port come from the `[server]` section; Rocket's own
/// defaults (and `ROCKET_*` env vars) apply otherwise. Blocks until Rocket
/// shuts down.
pub async fn launch_rocket(config: &Config, pipeline: Arc<Pipeline>) -> Result<()> {
    let mut fig = rocket::Config::figment();
    let server = config.server();
    if let Some(bind) = server.bind {
        fig = fig.merge(("address", bind));
    }
    if let Some(port) = server.port {
        fig = fig.merge(("port", port));
    }

    let keys = TokenKeys::from_config(&config.auth());
    let rocket = build_rocket(fig, AppState::new(pipeline), keys);

    tracing::info!("Starting Rocket HTTP server");
    rocket
        .launch()
        .await
        .map_err(|e| anyhow!("Rocket failed: {}", e))?;

    tracing::info!("Rocket HTTP server has shut down");
    Ok(())
}
