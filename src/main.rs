use anyhow::Result;
use camwatch::analysis::{Analyzer, HttpAnalyzer};
use camwatch::api::LiveApi;
use camwatch::config::{self, Config};
use camwatch::db::repositories::{JobStore, PgEventsRepository, PgJobsRepository};
use camwatch::db::DatabaseService;
use camwatch::recorder::segment::RotationPeriod;
use camwatch::recorder::{
    FfmpegEncoderFactory, FfmpegLiveLauncher, SchedulerSettings, SegmentScheduler,
    StorageCleanupService,
};
use camwatch::stream_manager::source::FfmpegClipOpener;
use camwatch::stream_manager::{StreamComponents, StreamManager};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn config_path() -> Option<PathBuf> {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("CAMWATCH_CONFIG").map(PathBuf::from))
}

fn analyzer(config: &Config) -> Result<Option<Arc<dyn Analyzer>>> {
    let Some(url) = &config.analyzer.url else {
        warn!("No analyzer URL configured, realtime detection is off");
        return Ok(None);
    };
    let analyzer = HttpAnalyzer::new(
        url,
        config.analyzer.api_key.clone(),
        Duration::from_secs(config.analyzer.timeout_secs),
    )?;
    Ok(Some(Arc::new(analyzer)))
}

async fn run_app() -> Result<()> {
    let config = Arc::new(config::load_config(config_path().as_deref())?);

    // Initialize logging; RUST_LOG overrides the configured level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.api.log_level))
        .init();
    info!("Starting camwatch with {} cameras", config.cameras.len());

    let db = DatabaseService::new(&config.database).await?;
    db.health_check().await;
    let jobs: Arc<dyn JobStore> = Arc::new(PgJobsRepository::new(db.pool.clone()));
    let events = Arc::new(PgEventsRepository::new(db.pool.clone()));

    std::fs::create_dir_all(&config.storage.recordings_root)?;
    std::fs::create_dir_all(&config.storage.live_root)?;

    let ffmpeg = &config.recording.ffmpeg_path;
    let components = StreamComponents {
        clip_opener: Arc::new(FfmpegClipOpener::new(ffmpeg)),
        encoders: Arc::new(FfmpegEncoderFactory::new(ffmpeg, &config.recording.format)),
        live_launcher: Arc::new(FfmpegLiveLauncher::new(ffmpeg)),
        analyzer: analyzer(&config)?,
        events,
    };
    let stream_manager = Arc::new(StreamManager::new(config.clone(), components));
    let cancel = CancellationToken::new();

    let mut schedulers = Vec::new();
    for camera in &config.cameras {
        if let Err(e) = stream_manager.start(camera.clone()).await {
            error!("Failed to start camera {}: {}", camera.id, e);
            continue;
        }

        if config.scheduler.enabled {
            let scheduler = Arc::new(SegmentScheduler::new(
                SchedulerSettings {
                    camera_id: camera.id.clone(),
                    segments_dir: config.storage.segments_dir(&camera.id),
                    extension: config.recording.format.clone(),
                    period: RotationPeriod::from_secs(config.recording.segment_period_secs)?,
                    grace: chrono::Duration::seconds(config.scheduler.grace_secs as i64),
                    max_retries: config.scheduler.max_retries,
                    require_marker: config.recording.completion_markers,
                    backfill: config.scheduler.backfill,
                },
                jobs.clone(),
            ));
            schedulers.push(scheduler.start(cancel.child_token()));
        }
    }
    info!("{} segment schedulers started", schedulers.len());

    let storage_cleanup = Arc::new(StorageCleanupService::new(
        config.cleanup.clone(),
        config.storage.clone(),
        jobs.clone(),
    ));
    storage_cleanup.start(cancel.child_token());

    let api = LiveApi::new(&config.api, stream_manager.clone());
    let api_cancel = cancel.child_token();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api.run(api_cancel).await {
            error!("Live API failed: {}", e);
        }
    });

    // Wait for termination signals
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    cancel.cancel();
    stream_manager.stop_all().await;
    for scheduler in schedulers {
        if let Err(e) = scheduler.await {
            error!("Scheduler task failed: {}", e);
        }
    }
    if let Err(e) = api_task.await {
        error!("Live API task failed: {}", e);
    }

    info!("Shutdown complete");
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

    if let Err(e) = runtime.block_on(run_app()) {
        eprintln!("Application error: {:#}", e);
        std::process::exit(1);
    }
}
