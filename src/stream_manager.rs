pub mod pipeline;
pub mod source;

use crate::analysis::{AnalysisHints, Analyzer, DetectorDecision, RealtimeDetector};
use crate::config::{CameraConfig, Config};
use crate::db::repositories::EventSink;
use crate::error::Error;
use crate::recorder::encoder::EncoderFactory;
use crate::recorder::live_packager::{LiveEncoderLauncher, LivePackager, LiveStatus};
use crate::recorder::record::{SegmentWriter, SegmentWriterConfig, WriteOutcome};
use crate::recorder::segment::{RotationPeriod, SegmentKind};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use pipeline::{FramePipeline, PipelineEvent, PipelineOutput};
use serde::Serialize;
use source::{ClipOpener, ClipOrder, ClipSource, SourceMultiplexer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Seconds of synthetic video per test-pattern clip
const TEST_PATTERN_CLIP_SECS: u32 = 10;

/// External collaborators shared by every camera
#[derive(Clone)]
pub struct StreamComponents {
    pub clip_opener: Arc<dyn ClipOpener>,
    pub encoders: Arc<dyn EncoderFactory>,
    pub live_launcher: Arc<dyn LiveEncoderLauncher>,
    /// Realtime detection is off without an analyzer
    pub analyzer: Option<Arc<dyn Analyzer>>,
    pub events: Arc<dyn EventSink>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Running,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub camera_id: String,
    pub state: StreamState,
    pub started_at: DateTime<Utc>,
    pub frames_emitted: u64,
    pub segments_opened: u64,
    pub write_errors: u64,
    pub realtime_dispatched: u64,
    pub current_segment: Option<PathBuf>,
    pub last_error: Option<String>,
    pub live: Option<LiveStatus>,
}

#[derive(Default)]
struct StreamStats {
    frames: AtomicU64,
    segments_opened: AtomicU64,
    write_errors: AtomicU64,
    realtime_dispatched: AtomicU64,
    current_segment: Mutex<Option<PathBuf>>,
    last_error: Mutex<Option<String>>,
}

impl StreamStats {
    fn set_current_segment(&self, path: PathBuf) {
        if let Ok(mut current) = self.current_segment.lock() {
            *current = Some(path);
        }
    }

    fn set_error(&self, message: String) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = Some(message);
        }
    }
}

struct ActiveStream {
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    packager: Option<Arc<LivePackager>>,
    stats: Arc<StreamStats>,
}

impl ActiveStream {
    async fn status(&self, camera_id: &str) -> StreamStatus {
        let last_error = self.stats.last_error.lock().ok().and_then(|e| e.clone());
        let state = if self.task.is_finished() {
            if last_error.is_some() {
                StreamState::Failed
            } else {
                StreamState::Stopped
            }
        } else if self.cancel.is_cancelled() {
            StreamState::Stopping
        } else {
            StreamState::Running
        };

        let live = match &self.packager {
            Some(packager) => Some(packager.status().await),
            None => None,
        };

        StreamStatus {
            camera_id: camera_id.to_string(),
            state,
            started_at: self.started_at,
            frames_emitted: self.stats.frames.load(Ordering::Relaxed),
            segments_opened: self.stats.segments_opened.load(Ordering::Relaxed),
            write_errors: self.stats.write_errors.load(Ordering::Relaxed),
            realtime_dispatched: self.stats.realtime_dispatched.load(Ordering::Relaxed),
            current_segment: self.stats.current_segment.lock().ok().and_then(|p| p.clone()),
            last_error,
            live,
        }
    }
}

/// Registry of running camera streams.
///
/// Each camera runs one frame loop task fed by its pipeline thread. The loop paces frames at
/// the ingest rate and fans them out to the segment and archive writers, the live packager and
/// the realtime detector.
pub struct StreamManager {
    config: Arc<Config>,
    components: StreamComponents,
    streams: RwLock<HashMap<String, ActiveStream>>,
}

impl StreamManager {
    pub fn new(config: Arc<Config>, components: StreamComponents) -> Self {
        Self {
            config,
            components,
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Start streaming a camera. A camera whose loop already ended may be started again.
    pub async fn start(&self, camera: CameraConfig) -> Result<(), Error> {
        let mut streams = self.streams.write().await;
        if let Some(existing) = streams.get(&camera.id) {
            if !existing.task.is_finished() {
                return Err(Error::AlreadyExists(format!(
                    "Camera {} is already streaming",
                    camera.id
                )));
            }
            streams.remove(&camera.id);
        }

        let config = &self.config;
        let camera_id = camera.id.clone();
        let ingest = config.pipeline.ingest;

        let order = if camera.shuffle {
            ClipOrder::Shuffled
        } else {
            ClipOrder::Ordered
        };
        let source = SourceMultiplexer::new(
            clip_pool(&camera, ingest.fps),
            order,
            ingest,
            self.components.clip_opener.clone(),
        )
        .map_err(|e| Error::Stream(format!("Camera {}: {}", camera_id, e)))?;

        let segment = SegmentWriter::new(
            SegmentWriterConfig {
                camera_id: camera_id.clone(),
                kind: SegmentKind::Segment,
                period: RotationPeriod::from_secs(config.recording.segment_period_secs)?,
                dir: config.storage.segments_dir(&camera_id),
                extension: config.recording.format.clone(),
                profile: config.pipeline.segment,
                completion_markers: config.recording.completion_markers,
            },
            self.components.encoders.clone(),
        );
        let archive = if config.recording.archive_enabled {
            Some(SegmentWriter::new(
                SegmentWriterConfig {
                    camera_id: camera_id.clone(),
                    kind: SegmentKind::Archive,
                    period: RotationPeriod::from_secs(config.recording.archive_period_secs)?,
                    dir: config.storage.archive_dir(&camera_id),
                    extension: config.recording.format.clone(),
                    profile: config.pipeline.archive,
                    completion_markers: config.recording.completion_markers,
                },
                self.components.encoders.clone(),
            ))
        } else {
            None
        };

        let cancel = CancellationToken::new();

        let packager = if config.live.enabled {
            let dir = config.storage.live_dir(&camera_id);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::Io(format!("Failed to create {:?}: {}", dir, e)))?;
            Some(Arc::new(LivePackager::start(
                &camera_id,
                &dir,
                config.pipeline.live,
                &config.live,
                self.components.live_launcher.clone(),
                cancel.child_token(),
            )))
        } else {
            None
        };

        let detector = match (&self.components.analyzer, config.realtime.enabled) {
            (Some(analyzer), true) => {
                let live_fps = config.pipeline.live.fps.min(ingest.fps).max(1) as u64;
                Some(RealtimeDetector::new(
                    &camera_id,
                    analyzer.clone(),
                    self.components.events.clone(),
                    AnalysisHints {
                        stage: config.analyzer.stage.clone(),
                        subject_age_months: config.analyzer.subject_age_months,
                    },
                    config.realtime.interval_secs.max(1) * live_fps,
                    config.realtime.jpeg_quality,
                ))
            }
            _ => None,
        };

        let (pipeline, frames) = FramePipeline::spawn(
            &camera_id,
            &config.pipeline,
            config.recording.archive_enabled,
            source,
        )?;

        let stats = Arc::new(StreamStats::default());
        let frame_loop = FrameLoop {
            camera_id: camera_id.clone(),
            interval: ingest.frame_interval(),
            pipeline,
            frames,
            segment,
            archive,
            packager: packager.clone(),
            detector,
            stats: stats.clone(),
        };
        let task = tokio::spawn(frame_loop.run(cancel.clone()));

        info!(
            "Started camera {} ({} at {} fps, live {})",
            camera_id,
            ingest.resolution(),
            ingest.fps,
            if packager.is_some() { "on" } else { "off" }
        );

        streams.insert(
            camera_id,
            ActiveStream {
                started_at: Utc::now(),
                cancel,
                task,
                packager,
                stats,
            },
        );
        Ok(())
    }

    /// Stop a camera and wait until its open segment is finalized
    pub async fn stop(&self, camera_id: &str) -> Result<(), Error> {
        let stream = self
            .streams
            .write()
            .await
            .remove(camera_id)
            .ok_or_else(|| Error::NotFound(format!("Camera {} is not streaming", camera_id)))?;

        info!("Stopping camera {}", camera_id);
        stream.cancel.cancel();
        if let Err(e) = stream.task.await {
            error!("Frame loop for {} panicked: {}", camera_id, e);
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let streams: Vec<_> = self.streams.write().await.drain().collect();
        for (_, stream) in &streams {
            stream.cancel.cancel();
        }
        for (camera_id, stream) in streams {
            if let Err(e) = stream.task.await {
                error!("Frame loop for {} panicked: {}", camera_id, e);
            }
        }
        info!("All cameras stopped");
    }

    pub async fn status(&self, camera_id: &str) -> Option<StreamStatus> {
        let streams = self.streams.read().await;
        match streams.get(camera_id) {
            Some(stream) => Some(stream.status(camera_id).await),
            None => None,
        }
    }

    pub async fn list(&self) -> Vec<StreamStatus> {
        let streams = self.streams.read().await;
        let mut statuses = Vec::with_capacity(streams.len());
        for (camera_id, stream) in streams.iter() {
            statuses.push(stream.status(camera_id).await);
        }
        statuses.sort_by(|a, b| a.camera_id.cmp(&b.camera_id));
        statuses
    }

    /// Current live manifest, once the first chunk is out
    pub async fn live_manifest(&self, camera_id: &str) -> Option<String> {
        let packager = self.packager(camera_id).await?;
        packager.manifest().await
    }

    /// Path of a chunk the manifest currently advertises
    pub async fn live_chunk_path(&self, camera_id: &str, file_name: &str) -> Option<PathBuf> {
        let packager = self.packager(camera_id).await?;
        if packager.is_advertised(file_name).await {
            Some(packager.dir().join(file_name))
        } else {
            None
        }
    }

    async fn packager(&self, camera_id: &str) -> Option<Arc<LivePackager>> {
        self.streams
            .read()
            .await
            .get(camera_id)
            .and_then(|stream| stream.packager.clone())
    }
}

/// Clip pool of a camera; synthetic patterns when asked for or when no clips are configured
fn clip_pool(camera: &CameraConfig, fps: u32) -> Vec<ClipSource> {
    if camera.test_pattern || camera.clips.is_empty() {
        let frames = fps.max(1) * TEST_PATTERN_CLIP_SECS;
        return (0..3)
            .map(|pattern| ClipSource::TestPattern { pattern, frames })
            .collect();
    }
    camera.clips.iter().cloned().map(ClipSource::File).collect()
}

struct FrameLoop {
    camera_id: String,
    interval: std::time::Duration,
    pipeline: FramePipeline,
    frames: mpsc::Receiver<PipelineEvent>,
    segment: SegmentWriter,
    archive: Option<SegmentWriter>,
    packager: Option<Arc<LivePackager>>,
    detector: Option<RealtimeDetector>,
    stats: Arc<StreamStats>,
}

impl FrameLoop {
    async fn run(mut self, cancel: CancellationToken) {
        let mut next_emit = Instant::now();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = self.frames.recv() => event,
            };
            let output = match event {
                Some(PipelineEvent::Frame(output)) => output,
                Some(PipelineEvent::Failed(e)) => {
                    error!("Camera {} lost its source: {}", self.camera_id, e);
                    self.stats.set_error(e);
                    break;
                }
                None => {
                    self.stats.set_error("frame pipeline stopped".into());
                    break;
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(next_emit) => {}
            }
            next_emit += self.interval;
            let now = Instant::now();
            if next_emit + self.interval < now {
                // Fell behind by more than a frame; resync instead of bursting
                next_emit = now;
            }

            self.emit(output, Utc::now()).await;
        }

        self.pipeline.stop();
        self.frames.close();

        let mut closed = self.segment.finalize().await;
        if let Some(archive) = self.archive.as_mut() {
            closed.extend(archive.finalize().await);
        }
        if let Some(packager) = &self.packager {
            packager.shutdown().await;
        }
        info!(
            "Camera {} stopped after {} frames, {} files closed",
            self.camera_id,
            self.stats.frames.load(Ordering::Relaxed),
            closed.len()
        );
    }

    async fn emit(&mut self, output: PipelineOutput, now: DateTime<Utc>) {
        if let Some(image) = &output.segment {
            self.write_track(now, image, SegmentKind::Segment).await;
        }
        if let Some(image) = &output.archive {
            self.write_track(now, image, SegmentKind::Archive).await;
        }

        if let Some(image) = output.live {
            if let Some(packager) = &self.packager {
                packager.push_frame(image.clone());
            }
            if let Some(detector) = self.detector.as_mut() {
                if detector.on_frame(image, now) == DetectorDecision::Dispatched {
                    self.stats.realtime_dispatched.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.stats.frames.fetch_add(1, Ordering::Relaxed);
    }

    async fn write_track(&mut self, now: DateTime<Utc>, image: &image::RgbImage, kind: SegmentKind) {
        let writer = match kind {
            SegmentKind::Segment => &mut self.segment,
            SegmentKind::Archive => match self.archive.as_mut() {
                Some(archive) => archive,
                None => return,
            },
        };

        match writer.write(now, image).await {
            Ok(WriteOutcome::Opened { opened, .. }) => {
                if kind == SegmentKind::Segment {
                    self.stats.segments_opened.fetch_add(1, Ordering::Relaxed);
                    self.stats.set_current_segment(opened.path);
                }
            }
            Ok(WriteOutcome::Written) => {}
            Err(e) => {
                self.stats.write_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Camera {} {} write failed: {}", self.camera_id, kind.prefix(), e);
            }
        }
    }
}
