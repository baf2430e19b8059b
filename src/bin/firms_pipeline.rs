//! FIRMS Pipeline - one ingestion + archival cycle per invocation
//!
//! Usage:
//!   cargo run --release --bin firms_pipeline
//!
//! Environment variables (see `PipelineConfig::from_env`):
//!   FIRMS_DB_PATH - SQLite database path (default: /var/lib/firmsflow/firms.db)
//!   FIRMS_DOWNLOAD_DIR - Feed tree root (default: /var/lib/firmsflow/downloads)
//!   FIRMS_LOCK_PATH - Run lock file (default: /var/lib/firmsflow/pipeline.lock)
//!   ARCHIVE_RETENTION_HOURS - Archival window (default: 24)
//!   RUN_DEADLINE_SECS - Stop starting new work after this long (default: unset)
//!
//! The run summary is printed to stdout as JSON; logs go to stderr.

use dotenv::dotenv;
use firmsflow::pipeline::{PipelineConfig, PipelineEngine, PipelineError, SqliteGateway};
use log::{error, info};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let config = PipelineConfig::from_env();

    info!("🔥 FIRMS Pipeline");
    info!("   ├─ Database: {}", config.db_path.display());
    info!("   ├─ Downloads: {}", config.download_dir.display());
    info!("   ├─ Retention: {}h", config.retention_hours);
    info!("   └─ Geometry preload: {}", config.preload_geometry);

    let gateway = Arc::new(SqliteGateway::open(&config.db_path)?);
    let engine = PipelineEngine::new(config, gateway);

    match engine.run_cycle().await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(PipelineError::AlreadyRunning(path)) => {
            info!("⏭️  Another run holds {}, exiting", path.display());
            Ok(())
        }
        Err(e) => {
            error!("❌ Pipeline run failed: {}", e);
            Err(e.into())
        }
    }
}
