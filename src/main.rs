use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use translation_ledger::scheduler;
use translation_ledger::search::MemoryIndex;
use translation_ledger::{Config, RevisionLedger, ScoredReferenceResolver};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (ignored in production)
    let _ = dotenvy::dotenv();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("translation_ledger=info".parse()?),
        )
        .init();

    info!("Starting translation ledger");

    let config = Arc::new(Config::from_env()?);
    info!("Using database {}", config.database_path);

    let ledger = Arc::new(
        RevisionLedger::from_config(&config, Arc::new(MemoryIndex::new()))
            .context("Failed to open ledger")?,
    );
    ledger
        .rebuild_index()
        .await
        .context("Failed to rebuild search index")?;

    let resolver = Arc::new(ScoredReferenceResolver::new(ledger.clone(), &config));
    let mut scheduler = scheduler::start_scheduler(config.clone(), ledger.clone(), resolver).await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");

    scheduler.shutdown().await?;
    info!(
        "Final metrics: {}",
        serde_json::to_string(&ledger.metrics().report())?
    );
    Ok(())
}
