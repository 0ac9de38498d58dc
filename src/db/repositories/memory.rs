//! In-process job queue and event sink.
//!
//! Used by tests and by single-process deployments without Postgres. A single mutex guards all
//! rows, which gives the claim the same all-or-nothing behaviour as the conditional update.

use super::events::EventSink;
use super::jobs::JobStore;
use crate::db::models::{AnalysisResultRecord, EnqueueOutcome, Job, NewJob, RealtimeEvent};
use crate::error::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    results: HashMap<Uuid, AnalysisResultRecord>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    tables: Mutex<Tables>,
    work: Notify,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn jobs(&self) -> Vec<Job> {
        let tables = self.tables.lock().await;
        let mut jobs: Vec<Job> = tables.jobs.values().cloned().collect();
        jobs.sort_by_key(|job| (job.created_at, job.segment_start));
        jobs
    }

    pub async fn result_for(&self, job_id: Uuid) -> Option<AnalysisResultRecord> {
        self.tables.lock().await.results.get(&job_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
        Ok(self.tables.lock().await.jobs.get(&job_id).cloned())
    }

    async fn find_by_segment(
        &self,
        camera_id: &str,
        segment_start: DateTime<Utc>,
    ) -> Result<Option<Job>, Error> {
        let tables = self.tables.lock().await;
        Ok(tables
            .jobs
            .values()
            .find(|job| job.camera_id == camera_id && job.segment_start == segment_start)
            .cloned())
    }

    async fn enqueue_if_absent(&self, job: NewJob) -> Result<EnqueueOutcome, Error> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables
            .jobs
            .values()
            .find(|j| j.camera_id == job.camera_id && j.segment_start == job.segment_start)
        {
            return Ok(EnqueueOutcome::AlreadyQueued(existing.clone()));
        }

        let created = Job::new(job, Utc::now());
        tables.jobs.insert(created.id, created.clone());
        drop(tables);

        self.work.notify_waiters();
        Ok(EnqueueOutcome::Created(created))
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>, Error> {
        let mut tables = self.tables.lock().await;
        let Some(job) = tables
            .jobs
            .values_mut()
            .filter(|job| job.status == crate::db::models::JobStatus::Pending)
            .min_by_key(|job| (job.created_at, job.segment_start))
        else {
            return Ok(None);
        };

        job.claim(worker_id, Utc::now())?;
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: &AnalysisResultRecord,
    ) -> Result<Job, Error> {
        let mut tables = self.tables.lock().await;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

        // Both writes happen under the same lock, or neither does
        job.complete(worker_id, result, Utc::now())?;
        let completed = job.clone();
        tables.results.insert(job_id, result.clone());
        Ok(completed)
    }

    async fn record_failure(
        &self,
        job_id: Uuid,
        worker_id: &str,
        message: &str,
        retryable: bool,
    ) -> Result<Job, Error> {
        let mut tables = self.tables.lock().await;
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

        let status = job.fail(worker_id, message, retryable, Utc::now())?;
        let job = job.clone();
        drop(tables);

        if !status.is_terminal() {
            self.work.notify_waiters();
        }
        Ok(job)
    }

    async fn reclaim_stale(&self, claimed_before: DateTime<Utc>) -> Result<Vec<Job>, Error> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut reclaimed = Vec::new();

        for job in tables.jobs.values_mut() {
            let expired = job.status == crate::db::models::JobStatus::Processing
                && job.started_at.map_or(false, |at| at < claimed_before);
            if expired {
                let message = format!(
                    "claim by {} expired",
                    job.worker_id.as_deref().unwrap_or("unknown")
                );
                job.reclaim(&message, now)?;
                reclaimed.push(job.clone());
            }
        }
        drop(tables);

        if reclaimed.iter().any(|job| !job.status.is_terminal()) {
            self.work.notify_waiters();
        }
        Ok(reclaimed)
    }

    async fn wait_for_work(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.work.notified())
            .await
            .is_ok()
    }
}

/// Collects realtime events in memory
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<RealtimeEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RealtimeEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn record(&self, event: &RealtimeEvent) -> Result<(), Error> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisReport;
    use crate::db::models::JobStatus;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn segment(camera_id: &str, minute: u32) -> NewJob {
        let start = Utc.with_ymd_and_hms(2024, 5, 17, 14, minute, 0).unwrap();
        NewJob {
            camera_id: camera_id.to_string(),
            video_path: format!("/data/{}/segment_{}.mp4", camera_id, minute),
            segment_start: start,
            segment_end: start + chrono::Duration::minutes(10),
            max_retries: 3,
        }
    }

    async fn assert_invariants(store: &MemoryJobStore) {
        for job in store.jobs().await {
            job.check_invariants().unwrap();
        }
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_per_segment() {
        let store = MemoryJobStore::new();
        let first = store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();
        let second = store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();
        let other_camera = store.enqueue_if_absent(segment("cam2", 0)).await.unwrap();

        assert!(first.was_created());
        assert!(!second.was_created());
        assert_eq!(first.job().id, second.job().id);
        assert!(other_camera.was_created());
        assert_eq!(store.jobs().await.len(), 2);
    }

    #[tokio::test]
    async fn two_workers_racing_for_one_job() {
        let store = Arc::new(MemoryJobStore::new());
        store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();

        let a = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next("worker-a").await })
        };
        let b = {
            let store = store.clone();
            tokio::spawn(async move { store.claim_next("worker-b").await })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();

        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Processing);
        let winner = a.or(b).unwrap();
        assert_eq!(jobs[0].worker_id, winner.worker_id);
        assert_invariants(&store).await;
    }

    #[tokio::test]
    async fn claims_take_the_oldest_pending_job() {
        let store = MemoryJobStore::new();
        let first = store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        store.enqueue_if_absent(segment("cam1", 10)).await.unwrap();

        let claimed = store.claim_next("worker-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.job().id);
    }

    #[tokio::test]
    async fn transient_failures_end_in_failed() {
        let store = MemoryJobStore::new();
        let job = store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();
        let id = job.job().id;

        let mut seen_retry_counts = Vec::new();
        for _ in 0..3 {
            let claimed = store.claim_next("worker-a").await.unwrap().unwrap();
            assert_eq!(claimed.id, id);
            let after = store
                .record_failure(id, "worker-a", "analyzer unavailable", true)
                .await
                .unwrap();
            seen_retry_counts.push(after.retry_count);
            assert_invariants(&store).await;
        }

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(seen_retry_counts, vec![1, 2, 3]);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
        assert!(store.claim_next("worker-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_stores_result_with_the_status() {
        let store = MemoryJobStore::new();
        store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();
        let job = store.claim_next("worker-a").await.unwrap().unwrap();

        let record =
            AnalysisResultRecord::from_report(&job, "worker-a", &AnalysisReport::default()).unwrap();
        // A worker that does not hold the claim cannot complete it
        assert!(store.complete(job.id, "worker-b", &record).await.is_err());
        assert!(store.result_for(job.id).await.is_none());

        let done = store.complete(job.id, "worker-a", &record).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(store.result_for(job.id).await.unwrap().processed_by, "worker-a");
        assert_invariants(&store).await;
    }

    #[tokio::test]
    async fn stale_claims_are_returned_to_the_queue() {
        let store = MemoryJobStore::new();
        store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();
        let job = store.claim_next("crashed-worker").await.unwrap().unwrap();

        let none = store
            .reclaim_stale(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(none.is_empty());

        let reclaimed = store
            .reclaim_stale(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, JobStatus::Pending);
        assert_eq!(reclaimed[0].retry_count, 1);

        // The crashed worker's late completion is rejected
        let record =
            AnalysisResultRecord::from_report(&job, "crashed-worker", &AnalysisReport::default())
                .unwrap();
        assert!(store.complete(job.id, "crashed-worker", &record).await.is_err());
        assert_invariants(&store).await;
    }

    #[tokio::test]
    async fn enqueue_wakes_a_waiting_worker() {
        let store = Arc::new(MemoryJobStore::new());
        let waiter = {
            let store = store.clone();
            tokio::spawn(async move { store.wait_for_work(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.enqueue_if_absent(segment("cam1", 0)).await.unwrap();

        assert!(waiter.await.unwrap());
    }
}
