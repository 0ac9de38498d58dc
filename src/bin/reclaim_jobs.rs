//! Maintenance sweep: returns jobs stuck in PROCESSING to the queue.
//!
//! The threshold comes from the first argument in seconds, or `WORKER_STALE_AFTER_SECS`.

use anyhow::{anyhow, Context, Result};
use camwatch::config::WorkerConfig;
use camwatch::db::repositories::{JobStore, PgJobsRepository};
use camwatch::db::DatabaseService;
use chrono::Utc;
use log::info;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = WorkerConfig::from_env()?;
    let stale_after = match std::env::args().nth(1) {
        Some(secs) => Duration::from_secs(
            secs.parse()
                .with_context(|| format!("Invalid threshold {:?}", secs))?,
        ),
        None => config
            .stale_after
            .ok_or_else(|| anyhow!("No stale threshold given"))?,
    };

    let db = DatabaseService::connect(&config.database_url).await?;
    let store = PgJobsRepository::new(Arc::clone(&db.pool));

    let cutoff = Utc::now() - chrono::Duration::from_std(stale_after)?;
    let reclaimed = store.reclaim_stale(cutoff).await?;
    for job in &reclaimed {
        info!(
            "Job {} ({} {}) is now {} after {}/{} attempts",
            job.id, job.camera_id, job.segment_start, job.status, job.retry_count, job.max_retries
        );
    }
    info!("Reclaimed {} jobs claimed before {}", reclaimed.len(), cutoff);
    Ok(())
}
