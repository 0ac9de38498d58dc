use crate::db::models::job_models::JOB_COLUMNS;
use crate::db::models::{AnalysisResultRecord, EnqueueOutcome, Job, NewJob};
use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Channel notified whenever a job becomes claimable
pub const JOBS_CHANNEL: &str = "analysis_jobs";

/// Durable job queue shared by the scheduler and the analysis workers.
///
/// Every mutation of a claimed job is conditional on the row still being PROCESSING under the
/// caller's worker id, so a worker whose claim was reclaimed cannot overwrite the new owner.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error>;

    async fn find_by_segment(
        &self,
        camera_id: &str,
        segment_start: DateTime<Utc>,
    ) -> Result<Option<Job>, Error>;

    /// Insert a job unless one already exists for the same (camera, segment_start)
    async fn enqueue_if_absent(&self, job: NewJob) -> Result<EnqueueOutcome, Error>;

    /// Atomically move the oldest PENDING job to PROCESSING for `worker_id`.
    /// `None` means nothing was claimed.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, Error>;

    /// Write the result row and mark the job COMPLETED in one transaction
    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: &AnalysisResultRecord,
    ) -> Result<Job, Error>;

    /// Count a failed attempt; the job goes back to PENDING or to FAILED when the budget is spent
    async fn record_failure(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
        retryable: bool,
    ) -> Result<Job, Error>;

    /// Return PROCESSING jobs claimed before `claimed_before` to the queue
    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, Error>;

    /// Wait until new work may be available or the timeout elapses.
    /// Returns true when woken by a notification.
    async fn wait_for_work(&self, timeout: Duration) -> bool;
}

/// Postgres job queue
pub struct PgJobsRepository {
    pool: Arc<PgPool>,
    listener: Mutex<Option<PgListener>>,
}

impl PgJobsRepository {
    /// Create a new jobs repository
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self {
            pool,
            listener: Mutex::new(None),
        }
    }

    async fn notify(&self, job_id: Uuid) {
        let result = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(JOBS_CHANNEL)
            .bind(job_id.to_string())
            .execute(&*self.pool)
            .await;
        // Workers still poll, a lost notification only delays pickup
        if let Err(e) = result {
            warn!("Failed to notify workers about job {}: {}", job_id, e);
        }
    }

    async fn connect_listener(&self) -> Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&*self.pool).await?;
        listener.listen(JOBS_CHANNEL).await?;
        Ok(listener)
    }
}

#[async_trait]
impl JobStore for PgJobsRepository {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
        sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM analysis_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to get job {}: {}", job_id, e)))
    }

    async fn find_by_segment(
        &self,
        camera_id: &str,
        segment_start: DateTime<Utc>,
    ) -> Result<Option<Job>, Error> {
        sqlx::query_as::<_, Job>(&format!(
            "SELECT {} FROM analysis_jobs WHERE camera_id = $1 AND segment_start = $2",
            JOB_COLUMNS
        ))
        .bind(camera_id)
        .bind(segment_start)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to look up segment job: {}", e)))
    }

    async fn enqueue_if_absent(&self, job: NewJob) -> Result<EnqueueOutcome, Error> {
        if let Some(existing) = self.find_by_segment(&job.camera_id, job.segment_start).await? {
            return Ok(EnqueueOutcome::AlreadyQueued(existing));
        }

        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO analysis_jobs (
                id, camera_id, video_path, segment_start, segment_end, status,
                retry_count, max_retries, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'PENDING', 0, $6, NOW())
            ON CONFLICT (camera_id, segment_start) DO NOTHING
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&job.camera_id)
        .bind(&job.video_path)
        .bind(job.segment_start)
        .bind(job.segment_end)
        .bind(job.max_retries.max(0))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to enqueue job: {}", e)))?;

        match inserted {
            Some(created) => {
                self.notify(created.id).await;
                Ok(EnqueueOutcome::Created(created))
            }
            // Another scheduler won the insert between the lookup and ours
            None => self
                .find_by_segment(&job.camera_id, job.segment_start)
                .await?
                .map(EnqueueOutcome::AlreadyQueued)
                .ok_or_else(|| {
                    Error::Database(format!(
                        "Job for {} at {} conflicted but cannot be found",
                        job.camera_id, job.segment_start
                    ))
                }),
        }
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, Error> {
        // Row locks taken by concurrent claimers are skipped, so two workers never pick the
        // same job and neither blocks on the other
        let claimed = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'PROCESSING', worker_id = $1, started_at = NOW()
            WHERE id = (
                SELECT id FROM analysis_jobs
                WHERE status = 'PENDING'
                ORDER BY created_at, segment_start
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            AND status = 'PENDING'
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(worker_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to claim job: {}", e)))?;

        if let Some(job) = &claimed {
            debug!("Worker {} claimed job {}", worker_id, job.id);
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: &AnalysisResultRecord,
    ) -> Result<Job, Error> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Database(format!("Failed to begin transaction: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO analysis_results (
                id, job_id, camera_id, segment_start, safety_score, incident_count,
                development_score, processed_by, report, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (job_id) DO UPDATE SET
                safety_score = EXCLUDED.safety_score,
                incident_count = EXCLUDED.incident_count,
                development_score = EXCLUDED.development_score,
                processed_by = EXCLUDED.processed_by,
                report = EXCLUDED.report,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(result.id)
        .bind(job_id)
        .bind(&result.camera_id)
        .bind(result.segment_start)
        .bind(result.safety_score)
        .bind(result.incident_count)
        .bind(result.development_score)
        .bind(&result.processed_by)
        .bind(&result.report)
        .bind(result.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to write analysis result: {}", e)))?;

        let completed = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE analysis_jobs
            SET status = 'COMPLETED',
                analysis_result = $3,
                safety_score = $4,
                incident_count = $5,
                development_score = $6,
                error_message = NULL,
                completed_at = NOW(),
                worker_id = NULL,
                started_at = NULL
            WHERE id = $1 AND status = 'PROCESSING' AND worker_id = $2
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(&result.report)
        .bind(result.safety_score)
        .bind(result.incident_count)
        .bind(result.development_score)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("Failed to complete job {}: {}", job_id, e)))?;

        // Dropping the transaction without commit rolls the result row back
        let completed = completed.ok_or_else(|| {
            Error::InvalidState(format!(
                "job {} is no longer claimed by {}",
                job_id, worker_id
            ))
        })?;

        tx.commit()
            .await
            .map_err(|e| Error::Database(format!("Failed to commit job {}: {}", job_id, e)))?;

        info!("Job {} completed by {}", job_id, worker_id);
        Ok(completed)
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
        retryable: bool,
    ) -> Result<Job, Error> {
        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            WITH next AS (
                SELECT id,
                       CASE WHEN $3 THEN retry_count + 1
                            ELSE GREATEST(retry_count + 1, max_retries)
                       END AS retry_count
                FROM analysis_jobs
                WHERE id = $1 AND status = 'PROCESSING' AND worker_id = $2
                FOR UPDATE
            )
            UPDATE analysis_jobs AS j
            SET retry_count = next.retry_count,
                status = CASE WHEN next.retry_count >= j.max_retries THEN 'FAILED' ELSE 'PENDING' END,
                completed_at = CASE WHEN next.retry_count >= j.max_retries THEN NOW() ELSE NULL END,
                error_message = $4,
                worker_id = NULL,
                started_at = NULL
            FROM next
            WHERE j.id = next.id
            RETURNING {}
            "#,
            prefixed_columns("j")
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(retryable)
        .bind(message)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record failure of job {}: {}", job_id, e)))?
        .ok_or_else(|| {
            Error::InvalidState(format!(
                "job {} is no longer claimed by {}",
                job_id, worker_id
            ))
        })?;

        if !job.status.is_terminal() {
            self.notify(job.id).await;
        }
        Ok(job)
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, Error> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            UPDATE analysis_jobs
            SET retry_count = retry_count + 1,
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'FAILED' ELSE 'PENDING' END,
                completed_at = CASE WHEN retry_count + 1 >= max_retries THEN NOW() ELSE NULL END,
                error_message = 'claim by ' || worker_id || ' expired',
                worker_id = NULL,
                started_at = NULL
            WHERE status = 'PROCESSING' AND started_at < $1
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(claimed_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to reclaim stale jobs: {}", e)))?;

        for job in jobs.iter().filter(|job| !job.status.is_terminal()) {
            self.notify(job.id).await;
        }
        Ok(jobs)
    }

    async fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            match self.connect_listener().await {
                Ok(listener) => *guard = Some(listener),
                Err(e) => {
                    warn!("Job notifications unavailable, falling back to polling: {}", e);
                    drop(guard);
                    tokio::time::sleep(timeout).await;
                    return false;
                }
            }
        }

        let Some(listener) = guard.as_mut() else {
            return false;
        };
        match tokio::time::timeout(timeout, listener.recv()).await {
            Ok(Ok(notification)) => {
                debug!("Job notification: {}", notification.payload());
                true
            }
            Ok(Err(e)) => {
                warn!("Job listener failed, reconnecting on next wait: {}", e);
                *guard = None;
                false
            }
            Err(_) => false,
        }
    }
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|column| format!("{}.{}", alias, column.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
