use anyhow::Context;
use clap::Parser;
use common::{init_db_pool, run_migrations, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use stash::pipeline::Pipeline;
use stash::storage::{LinkStore, PrincipalId, SqliteLinkStore};

/// Run one ingestion against the configured database and print the stored record.
#[derive(Parser, Debug)]
#[command(name = "ingest_url")]
struct Args {
    url: String,

    /// Owner id for the stored link
    #[arg(long, default_value_t = 1)]
    owner: i64,

    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config::load(args.config.as_deref()).await?;
    let pool = init_db_pool(&config.database.path).await?;
    run_migrations(&pool).await?;

    let store: Arc<dyn LinkStore> = Arc::new(SqliteLinkStore::new(pool));
    let pipeline = Pipeline::from_config(&config, store)?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });

    let record = pipeline
        .ingest(&args.url, PrincipalId(args.owner), &cancel)
        .await
        .context("ingestion failed")?;

    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}
