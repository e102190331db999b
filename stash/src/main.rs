/*
stash - server binary
Loads configuration, opens the link database and serves the links API.
*/

use anyhow::Context;
use clap::Parser;
use common::{init_db_pool, run_migrations, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use stash::pipeline::Pipeline;
use stash::server::launch_rocket;
use stash::storage::{LinkStore, SqliteLinkStore};

#[derive(Parser, Debug)]
#[command(name = "stash", about = "Stash link summarizer server")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Credentials and secrets may live in a local .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = match Config::load(args.config.as_deref()).await {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("failed to load configuration: {:#}", e);
            return Err(e);
        }
    };
    info!(config = ?args.config, "configuration loaded");

    let db_path = config.database.path.clone();
    let db_pool = init_db_pool(&db_path).await.map_err(|e| {
        error!(%e, db_path = %db_path, "failed to initialize database pool");
        e
    })?;
    run_migrations(&db_pool).await?;
    info!(db_path = %db_path, "database ready");

    let store: Arc<dyn LinkStore> = Arc::new(SqliteLinkStore::new(db_pool));
    let pipeline = Pipeline::from_config(&config, store).context("failed to build ingestion pipeline")?;

    info!("Launching Rocket HTTP server");
    if let Err(e) = launch_rocket(&config, Arc::new(pipeline)).await {
        error!("Rocket server failed: {:#}", e);
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}
