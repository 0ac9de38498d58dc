use crate::config::{StorageCleanupConfig, StorageConfig};
use crate::db::repositories::JobStore;
use crate::recorder::segment::{
    parse_segment_file_name, recorded_start, remove_segment_files, SegmentKind,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;

/// What one cleanup pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    /// Expired segments kept because their job has not settled
    pub kept_for_jobs: usize,
}

/// Storage cleanup service for segment and archive retention
pub struct StorageCleanupService {
    config: StorageCleanupConfig,
    storage: StorageConfig,
    store: Arc<dyn JobStore>,
}

impl StorageCleanupService {
    /// Create a new storage cleanup service
    pub fn new(
        config: StorageCleanupConfig,
        storage: StorageConfig,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            config,
            storage,
            store,
        }
    }

    /// Start the cleanup service in the background
    pub fn start(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enabled {
            info!("Storage cleanup service is disabled");
            return;
        }

        info!(
            "Starting storage cleanup service with interval of {} seconds",
            self.config.check_interval_secs
        );

        tokio::spawn(async move {
            let period = Duration::from_secs(self.config.check_interval_secs.max(1));
            let mut interval = interval(period);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                match self.run_cleanup(Utc::now()).await {
                    Ok(report) if report.deleted > 0 || report.kept_for_jobs > 0 => info!(
                        "Storage cleanup deleted {} files, kept {} awaiting analysis",
                        report.deleted, report.kept_for_jobs
                    ),
                    Ok(_) => debug!("Storage cleanup found nothing to delete"),
                    Err(e) => error!("Error running storage cleanup: {}", e),
                }
            }
        });
    }

    /// Delete segment and archive files older than the retention window. Segment files are
    /// only removed once their job is COMPLETED or FAILED, or when no job references them.
    pub async fn run_cleanup(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let cutoff = now - chrono::Duration::hours(self.config.max_retention_hours as i64);
        let mut report = CleanupReport::default();

        for (pattern, kind) in [
            ("*/segments/segment_*", SegmentKind::Segment),
            ("*/archive/archive_*", SegmentKind::Archive),
        ] {
            for (camera_id, path) in self.matching_files(pattern)? {
                let Some(parsed) = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(parse_segment_file_name)
                else {
                    continue;
                };
                if parsed.kind != kind || parsed.start >= cutoff {
                    continue;
                }

                if kind == SegmentKind::Segment {
                    let start = match recorded_start(&path, &parsed).await {
                        Ok(Some(start)) => start,
                        // An unmarked restart file was never enqueued
                        Ok(None) => parsed.start,
                        Err(e) => {
                            warn!("Keeping {:?}, marker is unreadable: {}", path, e);
                            continue;
                        }
                    };
                    match self.store.find_by_segment(&camera_id, start).await {
                        Ok(Some(job)) if !job.status.is_terminal() => {
                            report.kept_for_jobs += 1;
                            continue;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Keeping {:?}, job lookup failed: {}", path, e);
                            continue;
                        }
                    }
                }

                match remove_segment_files(&path).await {
                    Ok(()) => {
                        debug!("Deleted expired {:?}", path);
                        report.deleted += 1;
                    }
                    Err(e) => warn!("Failed to delete expired {:?}: {}", path, e),
                }
            }
        }

        Ok(report)
    }

    /// Files under `<recordings_root>/<pattern>`, paired with the camera directory name
    fn matching_files(&self, pattern: &str) -> Result<Vec<(String, PathBuf)>> {
        let full = self.storage.recordings_root.join(pattern);
        let full = full.to_string_lossy().into_owned();
        let entries = glob::glob(&full).map_err(|e| anyhow!("Invalid pattern {}: {}", full, e))?;

        let mut files = Vec::new();
        for path in entries.flatten() {
            if path.extension().map_or(false, |ext| ext == "done" || ext == "tmp") {
                continue;
            }
            let camera_id = path
                .parent()
                .and_then(|dir| dir.parent())
                .and_then(|dir| dir.file_name())
                .and_then(|name| name.to_str());
            if let Some(camera_id) = camera_id {
                files.push((camera_id.to_string(), path));
            }
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisReport;
    use crate::db::models::{AnalysisResultRecord, NewJob};
    use crate::db::repositories::MemoryJobStore;
    use crate::config::VideoProfile;
    use crate::recorder::segment::{
        completion_marker_path, restart_file_name, segment_file_name, write_completion_marker,
        CompletionMarker, SegmentInfo,
    };
    use chrono::TimeZone;

    fn at(day: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, day, h, 0, 0).unwrap()
    }

    fn touch(path: &std::path::Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[tokio::test]
    async fn expired_files_are_deleted_once_their_job_settles() {
        let root = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            recordings_root: root.path().to_owned(),
            live_root: root.path().join("live"),
        };
        let store = Arc::new(MemoryJobStore::new());

        let segments = storage.segments_dir("cam1");
        let done = segments.join(segment_file_name(SegmentKind::Segment, at(10, 1), "mp4"));
        let pending = segments.join(segment_file_name(SegmentKind::Segment, at(10, 2), "mp4"));
        let orphan = segments.join(segment_file_name(SegmentKind::Segment, at(10, 3), "mp4"));
        let fresh = segments.join(segment_file_name(SegmentKind::Segment, at(17, 9), "mp4"));
        let archive = storage
            .archive_dir("cam1")
            .join(segment_file_name(SegmentKind::Archive, at(10, 0), "mp4"));
        for path in [&done, &pending, &orphan, &fresh, &archive] {
            touch(path);
        }
        touch(&completion_marker_path(&done));

        for (start, path) in [(at(10, 1), &done), (at(10, 2), &pending)] {
            store
                .enqueue_if_absent(NewJob {
                    camera_id: "cam1".into(),
                    video_path: path.to_string_lossy().into_owned(),
                    segment_start: start,
                    segment_end: start + chrono::Duration::minutes(10),
                    max_retries: 3,
                })
                .await
                .unwrap();
        }
        let job = store.claim_next("worker-a").await.unwrap().unwrap();
        assert_eq!(job.segment_start, at(10, 1));
        let record =
            AnalysisResultRecord::from_report(&job, "worker-a", &AnalysisReport::default())
                .unwrap();
        store.complete(job.id, "worker-a", &record).await.unwrap();

        let service = StorageCleanupService::new(
            StorageCleanupConfig {
                enabled: true,
                max_retention_hours: 72,
                check_interval_secs: 60,
            },
            storage,
            store,
        );
        let report = service.run_cleanup(at(17, 10)).await.unwrap();

        assert_eq!(
            report,
            CleanupReport {
                deleted: 3,
                kept_for_jobs: 1
            }
        );
        assert!(!done.exists());
        assert!(!completion_marker_path(&done).exists());
        assert!(pending.exists());
        assert!(!orphan.exists());
        assert!(!archive.exists());
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn restart_files_wait_for_their_own_job() {
        let root = tempfile::tempdir().unwrap();
        let storage = StorageConfig {
            recordings_root: root.path().to_owned(),
            live_root: root.path().join("live"),
        };
        let store = Arc::new(MemoryJobStore::new());

        let restart = storage
            .segments_dir("cam1")
            .join(restart_file_name(SegmentKind::Segment, at(10, 1), "mp4", 1));
        touch(&restart);
        let start = at(10, 1) + chrono::Duration::minutes(4);
        write_completion_marker(&CompletionMarker {
            segment: SegmentInfo {
                camera_id: "cam1".into(),
                kind: SegmentKind::Segment,
                start,
                duration_secs: 360,
                profile: VideoProfile::new(4, 4, 5),
                path: restart.clone(),
            },
            frames: 1,
            closed_at: start + chrono::Duration::minutes(6),
        })
        .await
        .unwrap();
        store
            .enqueue_if_absent(NewJob {
                camera_id: "cam1".into(),
                video_path: restart.to_string_lossy().into_owned(),
                segment_start: start,
                segment_end: start + chrono::Duration::minutes(6),
                max_retries: 3,
            })
            .await
            .unwrap();

        let service = StorageCleanupService::new(
            StorageCleanupConfig {
                enabled: true,
                max_retention_hours: 72,
                check_interval_secs: 60,
            },
            storage,
            store,
        );
        let report = service.run_cleanup(at(17, 10)).await.unwrap();

        assert_eq!(report.kept_for_jobs, 1);
        assert!(restart.exists());
    }
}
