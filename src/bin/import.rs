//! Import translations exported from another project.
//!
//! Usage: import <destination-project> <batch.json>

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use translation_ledger::search::MemoryIndex;
use translation_ledger::{Config, CrossProjectReconciler, ImportBatch, RevisionLedger};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("translation_ledger=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        anyhow::bail!("Usage: {} <destination-project> <batch.json>", args[0]);
    }
    let destination = &args[1];
    let batch_path = &args[2];

    let raw = std::fs::read_to_string(batch_path)
        .with_context(|| format!("Failed to read {}", batch_path))?;
    let batch: ImportBatch =
        serde_json::from_str(&raw).with_context(|| format!("Invalid import batch {}", batch_path))?;
    info!(
        "Loaded {} source volumes from {}",
        batch.volumes.len(),
        batch_path
    );

    let config = Config::from_env()?;
    let ledger = Arc::new(
        RevisionLedger::from_config(&config, Arc::new(MemoryIndex::new()))
            .context("Failed to open ledger")?,
    );
    ledger
        .rebuild_index()
        .await
        .context("Failed to rebuild search index")?;

    let reconciler = CrossProjectReconciler::new(ledger, &config);
    let report = reconciler
        .import(destination, &batch)
        .await
        .with_context(|| format!("Import into {} failed", destination))?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
