use anyhow::{anyhow, Result};
use camwatch::analysis::HttpAnalyzer;
use camwatch::config::WorkerConfig;
use camwatch::db::repositories::PgJobsRepository;
use camwatch::db::DatabaseService;
use camwatch::worker::stability::DecodeCheck;
use camwatch::worker::{AnalysisWorker, WorkerSettings};
use log::{error, info};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[cfg(feature = "gst")]
async fn decode_check(_config: &WorkerConfig) -> Result<Arc<dyn DecodeCheck>> {
    use camwatch::worker::gst_probe::GstDiscovererCheck;
    Ok(Arc::new(GstDiscovererCheck::new(std::time::Duration::from_secs(10))?))
}

#[cfg(not(feature = "gst"))]
async fn decode_check(config: &WorkerConfig) -> Result<Arc<dyn DecodeCheck>> {
    use camwatch::worker::stability::FfprobeCheck;
    let check = FfprobeCheck::new(&config.ffprobe_path, config.stability_timeout);
    check.ensure_available().await?;
    Ok(Arc::new(check))
}

async fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = WorkerConfig::from_env()?;
    let analyzer_url = config
        .analyzer_url
        .clone()
        .ok_or_else(|| anyhow!("ANALYZER_URL must be set"))?;
    info!("Starting analysis worker {}", config.worker_id);

    let db = DatabaseService::connect(&config.database_url).await?;
    if !db.health_check().await {
        return Err(anyhow!("Job queue is not reachable"));
    }
    let store = Arc::new(PgJobsRepository::new(db.pool.clone()));
    let analyzer = Arc::new(HttpAnalyzer::new(
        &analyzer_url,
        config.analyzer_api_key.clone(),
        config.analyzer_timeout,
    )?);

    let worker = AnalysisWorker::new(
        WorkerSettings::from_config(&config),
        store,
        analyzer,
        decode_check(&config).await?,
    );

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutting down worker..."),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal.cancel();
    });

    worker.run(cancel).await;
    Ok(())
}

fn main() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run()) {
        eprintln!("Worker error: {:#}", e);
        std::process::exit(1);
    }
}
