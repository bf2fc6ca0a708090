use crate::config::Config;
use crate::ledger::{OutboxReport, RevisionLedger};
use crate::references::ScoredReferenceResolver;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Deferred index writes replayed per maintenance pass
const OUTBOX_FLUSH_LIMIT: usize = 500;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub outbox: OutboxReport,
    pub projects_refreshed: usize,
    pub projects_failed: Vec<String>,
}

/// Initialize and start the scheduler
pub async fn start_scheduler(
    config: Arc<Config>,
    ledger: Arc<RevisionLedger>,
    resolver: Arc<ScoredReferenceResolver>,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    info!("Scheduling reference resolver (cron: {})", config.resolver_schedule);
    let resolver_job = Job::new_async(config.resolver_schedule.as_str(), move |_uuid, _l| {
        let resolver = Arc::clone(&resolver);

        Box::pin(async move {
            if let Err(e) = resolver.run_until_drained().await {
                error!("Reference resolver pass failed: {}", e);
            }
        })
    })
    .context("Invalid resolver schedule")?;
    scheduler.add(resolver_job).await?;

    info!("Scheduling maintenance (cron: {})", config.maintenance_schedule);
    let maintenance_job = Job::new_async(config.maintenance_schedule.as_str(), move |_uuid, _l| {
        let ledger = Arc::clone(&ledger);

        Box::pin(async move {
            info!("⏰ Maintenance pass triggered");
            match run_maintenance(&ledger).await {
                Ok(report) => info!(
                    "✓ Maintenance finished: {} index writes replayed, {} projects refreshed",
                    report.outbox.replayed, report.projects_refreshed
                ),
                Err(e) => error!("Maintenance pass failed: {}", e),
            }
        })
    })
    .context("Invalid maintenance schedule")?;
    scheduler.add(maintenance_job).await?;

    scheduler.start().await?;
    info!("✓ Scheduler started");

    Ok(scheduler)
}

/// Replay deferred index writes and recompute every project's aggregates
pub async fn run_maintenance(ledger: &RevisionLedger) -> Result<MaintenanceReport> {
    let outbox = ledger
        .flush_index_outbox(OUTBOX_FLUSH_LIMIT)
        .await
        .context("Failed to replay index outbox")?;

    let mut report = MaintenanceReport {
        outbox,
        ..Default::default()
    };

    let projects = ledger.db().projects().context("Failed to list projects")?;
    for project in projects {
        match ledger.aggregates().refresh_project(&project) {
            Ok(_) => report.projects_refreshed += 1,
            Err(e) => {
                ledger.metrics().record_aggregate_failure();
                warn!("Aggregate refresh failed for {}: {}", project, e);
                report.projects_failed.push(project);
            }
        }
    }

    Ok(report)
}
