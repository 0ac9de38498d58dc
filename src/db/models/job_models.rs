use crate::analysis::AnalysisReport;
use crate::error::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting for a worker
    Pending,
    /// Claimed by exactly one worker
    Processing,
    Completed,
    /// Retry budget exhausted or unrecoverable input
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            JobStatus::Completed | JobStatus::Failed => true,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }

    /// PENDING -> PROCESSING -> {PENDING | COMPLETED | FAILED}
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Processing) => true,
            (JobStatus::Processing, JobStatus::Pending)
            | (JobStatus::Processing, JobStatus::Completed)
            | (JobStatus::Processing, JobStatus::Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "PROCESSING" => Ok(JobStatus::Processing),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(Error::Serialization(format!("unknown job status {:?}", other))),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for JobStatus {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("text")
    }
}

impl sqlx::Encode<'_, sqlx::Postgres> for JobStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

// Unknown values are an error rather than a silent default
impl<'r> sqlx::Decode<'r, sqlx::Postgres> for JobStatus {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let text = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(text.parse::<JobStatus>()?)
    }
}

/// Analysis job model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub camera_id: String,
    pub video_path: String,
    pub segment_start: DateTime<Utc>,
    pub segment_end: DateTime<Utc>,
    pub status: JobStatus,
    pub analysis_result: Option<serde_json::Value>,
    pub safety_score: Option<f64>,
    pub incident_count: Option<i32>,
    pub development_score: Option<f64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub worker_id: Option<String>,
}

/// Columns selected for every `Job` query
pub const JOB_COLUMNS: &str = "id, camera_id, video_path, segment_start, segment_end, status, \
    analysis_result, safety_score, incident_count, development_score, error_message, \
    created_at, started_at, completed_at, retry_count, max_retries, worker_id";

/// Job to be created by the scheduler
#[derive(Debug, Clone)]
pub struct NewJob {
    pub camera_id: String,
    pub video_path: String,
    pub segment_start: DateTime<Utc>,
    pub segment_end: DateTime<Utc>,
    pub max_retries: i32,
}

/// Result of an idempotent enqueue
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(Job),
    /// A job for the same (camera, segment_start) already exists, in any status
    AlreadyQueued(Job),
}

impl EnqueueOutcome {
    pub fn job(&self) -> &Job {
        match self {
            EnqueueOutcome::Created(job) | EnqueueOutcome::AlreadyQueued(job) => job,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// Summary fields copied onto the job row
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobSummary {
    pub safety_score: f64,
    pub incident_count: i32,
    pub development_score: f64,
}

impl From<&AnalysisReport> for JobSummary {
    fn from(report: &AnalysisReport) -> Self {
        Self {
            safety_score: report.safety.score,
            incident_count: i32::try_from(report.incident_count()).unwrap_or(i32::MAX),
            development_score: report.development.score,
        }
    }
}

/// Denormalized result row written in the same transaction that completes the job
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AnalysisResultRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub camera_id: String,
    pub segment_start: DateTime<Utc>,
    pub safety_score: f64,
    pub incident_count: i32,
    pub development_score: f64,
    pub processed_by: String,
    pub report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl AnalysisResultRecord {
    pub fn from_report(job: &Job, worker_id: &str, report: &AnalysisReport) -> Result<Self, Error> {
        let summary = JobSummary::from(report);
        let report = serde_json::to_value(report)
            .map_err(|e| Error::Serialization(format!("Failed to encode report: {}", e)))?;
        Ok(Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            camera_id: job.camera_id.clone(),
            segment_start: job.segment_start,
            safety_score: summary.safety_score,
            incident_count: summary.incident_count,
            development_score: summary.development_score,
            processed_by: worker_id.to_string(),
            report,
            created_at: Utc::now(),
        })
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            safety_score: self.safety_score,
            incident_count: self.incident_count,
            development_score: self.development_score,
        }
    }
}

/// Retry count after one failed attempt. Non-retryable failures consume the whole budget.
pub fn next_retry_count(retry_count: i32, max_retries: i32, retryable: bool) -> i32 {
    let next = retry_count.saturating_add(1);
    if retryable {
        next
    } else {
        next.max(max_retries)
    }
}

impl Job {
    pub fn new(new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            camera_id: new_job.camera_id,
            video_path: new_job.video_path,
            segment_start: new_job.segment_start,
            segment_end: new_job.segment_end,
            status: JobStatus::Pending,
            analysis_result: None,
            safety_score: None,
            incident_count: None,
            development_score: None,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: new_job.max_retries.max(0),
            worker_id: None,
        }
    }

    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Processing && self.worker_id.as_deref() == Some(worker_id)
    }

    /// PENDING -> PROCESSING
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), Error> {
        self.transition(JobStatus::Processing)?;
        self.worker_id = Some(worker_id.to_string());
        self.started_at = Some(now);
        Ok(())
    }

    /// PROCESSING -> COMPLETED, only for the claiming worker
    pub fn complete(
        &mut self,
        worker_id: &str,
        result: &AnalysisResultRecord,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.ensure_claimed_by(worker_id)?;
        self.transition(JobStatus::Completed)?;
        let summary = result.summary();
        self.analysis_result = Some(result.report.clone());
        self.safety_score = Some(summary.safety_score);
        self.incident_count = Some(summary.incident_count);
        self.development_score = Some(summary.development_score);
        self.error_message = None;
        self.completed_at = Some(now);
        self.release();
        Ok(())
    }

    /// PROCESSING -> PENDING or FAILED, only for the claiming worker
    pub fn fail(
        &mut self,
        worker_id: &str,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, Error> {
        self.ensure_claimed_by(worker_id)?;
        self.settle_failure(message, retryable, now)
    }

    /// Return an abandoned claim to the queue, counting it as a failed attempt
    pub fn reclaim(&mut self, message: &str, now: DateTime<Utc>) -> Result<JobStatus, Error> {
        if self.status != JobStatus::Processing {
            return Err(Error::InvalidState(format!(
                "job {} is {}, not PROCESSING",
                self.id, self.status
            )));
        }
        self.settle_failure(message, true, now)
    }

    fn settle_failure(
        &mut self,
        message: &str,
        retryable: bool,
        now: DateTime<Utc>,
    ) -> Result<JobStatus, Error> {
        let retry_count = next_retry_count(self.retry_count, self.max_retries, retryable);
        let next = if retry_count >= self.max_retries {
            JobStatus::Failed
        } else {
            JobStatus::Pending
        };
        self.transition(next)?;
        self.retry_count = retry_count;
        self.error_message = Some(message.to_string());
        self.completed_at = (next == JobStatus::Failed).then_some(now);
        self.release();
        Ok(next)
    }

    fn ensure_claimed_by(&self, worker_id: &str) -> Result<(), Error> {
        if self.is_claimed_by(worker_id) {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "job {} is not claimed by {} (status {}, worker {:?})",
                self.id, worker_id, self.status, self.worker_id
            )))
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), Error> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidState(format!(
                "job {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    fn release(&mut self) {
        self.worker_id = None;
        self.started_at = None;
    }

    /// Check the row-level invariants the job table also enforces
    pub fn check_invariants(&self) -> Result<(), String> {
        let claimed = self.worker_id.is_some() && self.started_at.is_some();
        let unclaimed = self.worker_id.is_none() && self.started_at.is_none();
        match self.status {
            JobStatus::Processing if !claimed => {
                return Err(format!("job {} is PROCESSING without a claim", self.id))
            }
            JobStatus::Pending | JobStatus::Completed | JobStatus::Failed if !unclaimed => {
                return Err(format!("job {} is {} but still claimed", self.id, self.status))
            }
            _ => {}
        }
        if self.status == JobStatus::Failed && self.retry_count < self.max_retries {
            return Err(format!(
                "job {} is FAILED with retry budget left ({}/{})",
                self.id, self.retry_count, self.max_retries
            ));
        }
        Ok(())
    }
}
