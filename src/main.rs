//! dsrules server: rule endpoints, training jobs and the progress websocket.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use dsrules::config::ServiceConfig;
use dsrules::jobs::TrainingService;
use dsrules::{server, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env()?;
    telemetry::init_logging();

    println!("\n{}", "═".repeat(60));
    println!("🧮 dsrules v{}", env!("CARGO_PKG_VERSION"));
    println!("{}\n", "═".repeat(60));

    std::fs::create_dir_all(&config.models_dir)
        .with_context(|| format!("Failed to create models directory {:?}", config.models_dir))?;
    info!(workers = config.workers, db = ?config.database_path, "Starting training service");

    let service = Arc::new(TrainingService::start(config).await?);

    let server = server::run_server(service.clone());
    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("👋 Shutting down");
        }
    }
    service.shutdown().await;
    Ok(())
}
