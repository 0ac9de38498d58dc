//! Analysis worker: claims segment jobs, analyzes the files and records the outcome.
//!
//! Workers are independent processes that only share the job store and the filesystem.
//! Nothing that goes wrong with one job escapes [`AnalysisWorker::process`]; it is recorded on
//! the job row and the loop moves on.

#[cfg(feature = "gst")]
pub mod gst_probe;
pub mod retry;
pub mod stability;

use crate::analysis::{
    content_type_for, AnalysisHints, AnalysisReport, AnalysisRequest, Analyzer, AnalyzerError,
};
use crate::config::WorkerConfig;
use crate::db::models::{AnalysisResultRecord, Job, JobStatus};
use crate::db::repositories::JobStore;
use crate::error::Error;
use crate::recorder::segment::remove_segment_files;
use chrono::Utc;
use log::{debug, error, info, warn};
use retry::{jittered, Backoff, RetryPolicy};
use stability::{DecodeCheck, StabilityProbe, StabilitySettings};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why processing one job failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("analyzer kept failing: {0}")]
    TransientAnalyzer(String),
    #[error("analyzer rejected the segment: {0}")]
    PermanentAnalyzer(String),
    #[error("segment not stable: {0}")]
    FileNotStable(String),
    #[error("segment missing: {0}")]
    FileMissing(String),
    #[error("failed to store result: {0}")]
    ResultPersistence(String),
    #[error("failed to read segment: {0}")]
    Io(String),
}

/// What a job error does to the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Counts against the job's retry budget
    Retry,
    /// Fails the job now
    Terminal,
}

impl JobError {
    pub fn disposition(&self) -> Disposition {
        match self {
            JobError::TransientAnalyzer(_)
            | JobError::PermanentAnalyzer(_)
            | JobError::FileNotStable(_)
            | JobError::ResultPersistence(_)
            | JobError::Io(_) => Disposition::Retry,
            JobError::FileMissing(_) => Disposition::Terminal,
        }
    }
}

impl From<AnalyzerError> for JobError {
    fn from(err: AnalyzerError) -> Self {
        match err {
            AnalyzerError::Transient(msg) => JobError::TransientAnalyzer(msg),
            AnalyzerError::Permanent(msg) => JobError::PermanentAnalyzer(msg),
        }
    }
}

/// Result of processing one claimed job
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Completed(Job),
    /// Back in the queue with budget left
    Retrying(Job),
    Failed(Job),
    /// The outcome could not be recorded; the stale-job sweep will return the job
    Abandoned(String),
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    pub delete_after_analysis: bool,
    /// Periodically return PROCESSING jobs claimed longer ago than this
    pub stale_after: Option<Duration>,
    pub stability: StabilitySettings,
    pub hints: AnalysisHints,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            poll_interval: config.poll_interval,
            retry: RetryPolicy::new(config.max_attempts, Backoff::Fixed(config.retry_delay)),
            delete_after_analysis: config.delete_after_analysis,
            stale_after: config.stale_after,
            stability: StabilitySettings {
                min_age: config.min_file_age,
                min_bytes: config.min_file_bytes,
                require_marker: config.require_marker,
                timeout: config.stability_timeout,
                poll: config.stability_poll,
            },
            hints: AnalysisHints {
                stage: config.analysis_stage.clone(),
                subject_age_months: config.subject_age_months,
            },
        }
    }
}

pub struct AnalysisWorker {
    settings: WorkerSettings,
    store: Arc<dyn JobStore>,
    analyzer: Arc<dyn Analyzer>,
    probe: StabilityProbe,
}

impl AnalysisWorker {
    pub fn new(
        settings: WorkerSettings,
        store: Arc<dyn JobStore>,
        analyzer: Arc<dyn Analyzer>,
        decoder: Arc<dyn DecodeCheck>,
    ) -> Self {
        let probe = StabilityProbe::new(settings.stability.clone(), decoder);
        Self {
            settings,
            store,
            analyzer,
            probe,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Claim and process jobs until cancelled. Idle workers wait for a queue notification or
    /// a jittered poll interval, whichever comes first.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            "Analysis worker {} started (poll every {:?})",
            self.settings.worker_id, self.settings.poll_interval
        );
        let mut next_sweep = Instant::now();

        while !cancel.is_cancelled() {
            if let Some(stale_after) = self.settings.stale_after {
                if Instant::now() >= next_sweep {
                    if let Err(e) = self.reclaim_stale(stale_after).await {
                        error!("Stale job sweep failed: {}", e);
                    }
                    next_sweep = Instant::now() + stale_after.max(Duration::from_secs(60));
                }
            }

            match self.run_once().await {
                // Look for more work right away
                Ok(Some(_)) => continue,
                Ok(None) => {
                    let wait = jittered(self.settings.poll_interval);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        woken = self.store.wait_for_work(wait) => {
                            if woken {
                                debug!("Worker {} woken by the queue", self.settings.worker_id);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Worker {} failed to claim a job: {}", self.settings.worker_id, e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(jittered(self.settings.poll_interval)) => {}
                    }
                }
            }
        }

        info!("Analysis worker {} stopped", self.settings.worker_id);
    }

    /// Claim the oldest pending job and process it. `None` when the queue is empty.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, Error> {
        let Some(job) = self.store.claim_next(&self.settings.worker_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.process(job).await))
    }

    /// Process a job this worker has claimed
    pub async fn process(&self, job: Job) -> JobOutcome {
        info!(
            "Worker {} processing job {} ({} {}, attempt {}/{})",
            self.settings.worker_id,
            job.id,
            job.camera_id,
            job.segment_start,
            job.retry_count + 1,
            job.max_retries
        );

        match self.analyze(&job).await {
            Ok(report) => self.apply(job, report).await,
            Err(e) => self.fail(job, e).await,
        }
    }

    async fn analyze(&self, job: &Job) -> Result<AnalysisReport, JobError> {
        let path = Path::new(&job.video_path);
        let size = self.probe.wait_until_stable(path).await?;

        let data = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => JobError::FileMissing(format!("{:?}: {}", path, e)),
            _ => JobError::Io(format!("{:?}: {}", path, e)),
        })?;
        debug!("Read {} bytes of {:?} (probed {})", data.len(), path, size);

        let content_type = content_type_for(path);
        let what = format!("Analysis of job {}", job.id);
        let report = self
            .settings
            .retry
            .run(&what, |_| {
                self.analyzer.analyze(AnalysisRequest {
                    camera_id: job.camera_id.clone(),
                    content_type,
                    data: data.clone(),
                    hints: self.settings.hints.clone(),
                })
            })
            .await?;
        Ok(report)
    }

    async fn apply(&self, job: Job, report: AnalysisReport) -> JobOutcome {
        let worker_id = &self.settings.worker_id;
        let record = match AnalysisResultRecord::from_report(&job, worker_id, &report) {
            Ok(record) => record,
            Err(e) => return self.fail(job, JobError::ResultPersistence(e.to_string())).await,
        };

        let completed = match self.store.complete(job.id, worker_id, &record).await {
            Ok(completed) => completed,
            Err(e) => return self.fail(job, JobError::ResultPersistence(e.to_string())).await,
        };
        info!(
            "Job {} completed: safety {:.2}, {} incidents, development {:.2}",
            completed.id, record.safety_score, record.incident_count, record.development_score
        );

        // Only after the result is committed
        if self.settings.delete_after_analysis {
            match remove_segment_files(Path::new(&completed.video_path)).await {
                Ok(()) => debug!("Deleted analyzed segment {}", completed.video_path),
                Err(e) => warn!("Failed to delete {}: {}", completed.video_path, e),
            }
        }

        JobOutcome::Completed(completed)
    }

    async fn fail(&self, job: Job, error: JobError) -> JobOutcome {
        let retryable = error.disposition() == Disposition::Retry;
        let message = error.to_string();

        match self
            .store
            .record_failure(job.id, &self.settings.worker_id, &message, retryable)
            .await
        {
            Ok(updated) => match updated.status {
                JobStatus::Pending => {
                    warn!(
                        "Job {} failed ({}/{}), will retry: {}",
                        updated.id, updated.retry_count, updated.max_retries, message
                    );
                    JobOutcome::Retrying(updated)
                }
                JobStatus::Failed => {
                    error!(
                        "Job {} failed for good after {} attempts: {}",
                        updated.id, updated.retry_count, message
                    );
                    JobOutcome::Failed(updated)
                }
                other => JobOutcome::Abandoned(format!(
                    "job {} is {} after recording a failure",
                    updated.id, other
                )),
            },
            Err(e) => {
                error!("Failed to record failure of job {}: {} ({})", job.id, e, message);
                JobOutcome::Abandoned(e.to_string())
            }
        }
    }

    /// Return jobs stuck in PROCESSING longer than `stale_after` to the queue
    pub async fn reclaim_stale(&self, stale_after: Duration) -> Result<usize, Error> {
        let threshold = chrono::Duration::from_std(stale_after)
            .map_err(|e| Error::Config(format!("Invalid stale threshold: {}", e)))?;
        let reclaimed = self.store.reclaim_stale(Utc::now() - threshold).await?;
        for job in &reclaimed {
            warn!(
                "Reclaimed stale job {} (now {}, {}/{})",
                job.id, job.status, job.retry_count, job.max_retries
            );
        }
        Ok(reclaimed.len())
    }
}
