use crate::db::models::{EnqueueOutcome, NewJob};
use crate::db::repositories::JobStore;
use crate::error::Error;
use crate::recorder::segment::{
    is_marked_complete, parse_segment_file_name, read_completion_marker, segment_file_name,
    RotationPeriod, SegmentKind,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settings of one camera's scheduler
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub camera_id: String,
    pub segments_dir: PathBuf,
    pub extension: String,
    pub period: RotationPeriod,
    pub grace: chrono::Duration,
    pub max_retries: i32,
    /// Only enqueue segments whose completion marker exists
    pub require_marker: bool,
    pub backfill: bool,
}

/// Result of one scheduler tick
#[derive(Debug, Clone)]
pub enum TickOutcome {
    Enqueued(EnqueueOutcome),
    /// No file for the segment (stream was not running)
    Missing(PathBuf),
    /// The file exists but the writer has not marked it closed yet
    NotClosed(PathBuf),
}

/// Enqueues one job per completed segment, shortly after each rotation boundary
pub struct SegmentScheduler {
    settings: SchedulerSettings,
    store: Arc<dyn JobStore>,
}

impl SegmentScheduler {
    pub fn new(settings: SchedulerSettings, store: Arc<dyn JobStore>) -> Self {
        Self { settings, store }
    }

    /// First `boundary + grace` strictly after `now`
    pub fn next_tick(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = self.settings.period.floor(now) + self.settings.grace;
        if candidate > now {
            candidate
        } else {
            candidate + self.settings.period.as_duration()
        }
    }

    /// Enqueue the segment that ended at the most recent boundary before `now`, then catch up
    /// on closed segments an earlier tick could not enqueue
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, Error> {
        let outcome = self.enqueue_previous(now).await?;

        let caught_up = self.backfill(now).await?;
        if caught_up > 0 {
            info!(
                "Caught up on {} late segments for camera {}",
                caught_up, self.settings.camera_id
            );
        }
        Ok(outcome)
    }

    async fn enqueue_previous(&self, now: DateTime<Utc>) -> Result<TickOutcome, Error> {
        let segment_start = self.settings.period.previous_segment_start(now);
        let path = self.settings.segments_dir.join(segment_file_name(
            SegmentKind::Segment,
            segment_start,
            &self.settings.extension,
        ));

        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(TickOutcome::Missing(path));
        }
        if self.settings.require_marker && !is_marked_complete(&path) {
            return Ok(TickOutcome::NotClosed(path));
        }

        let segment_end = segment_start + self.settings.period.as_duration();
        self.enqueue(segment_start, segment_end, &path)
            .await
            .map(TickOutcome::Enqueued)
    }

    async fn enqueue(
        &self,
        segment_start: DateTime<Utc>,
        segment_end: DateTime<Utc>,
        path: &Path,
    ) -> Result<EnqueueOutcome, Error> {
        let outcome = self
            .store
            .enqueue_if_absent(NewJob {
                camera_id: self.settings.camera_id.clone(),
                video_path: path.to_string_lossy().into_owned(),
                segment_start,
                segment_end,
                max_retries: self.settings.max_retries,
            })
            .await?;

        match &outcome {
            EnqueueOutcome::Created(job) => info!(
                "Queued job {} for camera {} segment {}",
                job.id, job.camera_id, segment_start
            ),
            EnqueueOutcome::AlreadyQueued(job) => debug!(
                "Segment {} of camera {} already has job {} ({})",
                segment_start, job.camera_id, job.id, job.status
            ),
        }
        Ok(outcome)
    }

    /// Enqueue closed segments on disk that have no job yet. Returns the number of new jobs.
    pub async fn backfill(&self, now: DateTime<Utc>) -> Result<usize, Error> {
        let pattern = self
            .settings
            .segments_dir
            .join(format!("segment_*.{}", self.settings.extension));
        let pattern = pattern.to_string_lossy().into_owned();
        let current_start = self.settings.period.floor(now);

        let paths = glob::glob(&pattern)
            .map_err(|e| Error::Config(format!("Invalid segment pattern {}: {}", pattern, e)))?;

        let mut created = 0;
        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    warn!("Skipping unreadable segment entry: {}", e);
                    continue;
                }
            };
            let Some(parsed) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(parse_segment_file_name)
            else {
                continue;
            };

            // The open period is not done yet
            if parsed.start >= current_start {
                continue;
            }
            if self.settings.require_marker && !is_marked_complete(&path) {
                debug!("Not backfilling unfinished {:?}", path);
                continue;
            }

            let (start, end) = if parsed.restart.is_none() {
                (parsed.start, parsed.start + self.settings.period.as_duration())
            } else {
                // A restart file starts mid-period; only its marker knows where
                match read_completion_marker(&path).await {
                    Ok(Some(marker)) => (marker.segment.start, marker.segment.nominal_end()),
                    Ok(None) => {
                        warn!("Restart file {:?} has no marker, not enqueueing it", path);
                        continue;
                    }
                    Err(e) => {
                        warn!("Skipping restart file {:?}: {}", path, e);
                        continue;
                    }
                }
            };

            if self.enqueue(start, end, &path).await?.was_created() {
                created += 1;
            }
        }

        Ok(created)
    }

    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let camera_id = self.settings.camera_id.clone();

            if self.settings.backfill {
                match self.backfill(Utc::now()).await {
                    Ok(0) => {}
                    Ok(count) => info!("Backfilled {} segments for camera {}", count, camera_id),
                    Err(e) => error!("Backfill for camera {} failed: {}", camera_id, e),
                }
            }

            loop {
                let now = Utc::now();
                let wait = (self.next_tick(now) - now).to_std().unwrap_or_default();
                debug!("Scheduler for {} sleeping {:?}", camera_id, wait);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }

                match self.tick(Utc::now()).await {
                    Ok(TickOutcome::Enqueued(_)) => {}
                    Ok(TickOutcome::Missing(path)) => {
                        debug!("No segment to enqueue at {:?}", path)
                    }
                    Ok(TickOutcome::NotClosed(path)) => {
                        warn!("Segment {:?} is not closed after the grace period", path)
                    }
                    Err(e) => error!("Scheduler tick for camera {} failed: {}", camera_id, e),
                }
            }

            info!("Scheduler for camera {} stopped", camera_id);
        })
    }
}
