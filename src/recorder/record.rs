use crate::config::VideoProfile;
use crate::error::Error;
use crate::recorder::encoder::{EncoderFactory, FrameEncoder};
use crate::recorder::segment::{
    completion_marker_path, restart_file_name, segment_file_name, write_completion_marker,
    CompletionMarker, RotationPeriod, SegmentInfo, SegmentKind,
};
use chrono::{DateTime, SubsecRound, Utc};
use image::RgbImage;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Static settings of one rotating track
#[derive(Debug, Clone)]
pub struct SegmentWriterConfig {
    pub camera_id: String,
    pub kind: SegmentKind,
    pub period: RotationPeriod,
    pub dir: PathBuf,
    pub extension: String,
    pub profile: VideoProfile,
    pub completion_markers: bool,
}

/// What a call to [`SegmentWriter::write`] did besides writing the frame
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    Written,
    /// A new file was opened; `closed` is the file that was handed to the background closer
    Opened {
        opened: SegmentInfo,
        closed: Option<SegmentInfo>,
    },
}

struct OpenSegment {
    info: SegmentInfo,
    encoder: Box<dyn FrameEncoder>,
    /// Cached next boundary so the per-frame check is a single comparison
    boundary: DateTime<Utc>,
}

/// Writes one track to files rotated on wall-clock boundaries.
///
/// The file covering `[floor(now), floor(now) + period)` is named after its boundary start.
/// Closed files are finished in the background, and their completion marker is only written
/// after the encoder exits cleanly.
pub struct SegmentWriter {
    config: SegmentWriterConfig,
    factory: Arc<dyn EncoderFactory>,
    current: Option<OpenSegment>,
    closing: Vec<JoinHandle<Option<SegmentInfo>>>,
}

impl SegmentWriter {
    pub fn new(config: SegmentWriterConfig, factory: Arc<dyn EncoderFactory>) -> Self {
        Self {
            config,
            factory,
            current: None,
            closing: Vec::new(),
        }
    }

    pub fn kind(&self) -> SegmentKind {
        self.config.kind
    }

    pub fn current_segment(&self) -> Option<&SegmentInfo> {
        self.current.as_ref().map(|open| &open.info)
    }

    /// Write one frame captured at `now`, rotating first if `now` crossed the boundary
    pub async fn write(
        &mut self,
        now: DateTime<Utc>,
        image: &RgbImage,
    ) -> Result<WriteOutcome, Error> {
        let mut outcome = WriteOutcome::Written;

        let crossed = self
            .current
            .as_ref()
            .map_or(true, |open| now >= open.boundary);
        if crossed {
            let closed = self.current.take().map(|open| self.close_in_background(open));
            let open = self.open_segment(now).await?;
            outcome = WriteOutcome::Opened {
                opened: open.info.clone(),
                closed,
            };
            self.current = Some(open);
        }

        let Some(open) = self.current.as_mut() else {
            return Err(Error::Internal("segment writer has no open file".into()));
        };
        if let Err(e) = open.encoder.write_frame(image).await {
            // Drop the broken encoder; the next frame reopens the same period
            let info = open.info.clone();
            self.current = None;
            error!("Write to {:?} failed, abandoning it: {}", info.path, e);
            return Err(e);
        }

        Ok(outcome)
    }

    /// Close the open file and wait for every pending close. Returns the files that were
    /// closed cleanly.
    pub async fn finalize(&mut self) -> Vec<SegmentInfo> {
        if let Some(open) = self.current.take() {
            let info = self.close_in_background(open);
            info!("Finalizing {:?}", info.path);
        }

        let mut closed = Vec::new();
        for handle in self.closing.drain(..) {
            match handle.await {
                Ok(Some(info)) => closed.push(info),
                Ok(None) => {}
                Err(e) => error!("Segment close task failed: {}", e),
            }
        }
        closed
    }

    fn close_in_background(&mut self, open: OpenSegment) -> SegmentInfo {
        self.closing.retain(|handle| !handle.is_finished());

        let info = open.info.clone();
        let write_marker = self.config.completion_markers;
        self.closing.push(tokio::spawn(async move {
            close_segment(open.info, open.encoder, write_marker).await
        }));
        info
    }

    async fn open_segment(&self, now: DateTime<Utc>) -> Result<OpenSegment, Error> {
        let start = self.config.period.floor(now);
        tokio::fs::create_dir_all(&self.config.dir)
            .await
            .map_err(|e| Error::Io(format!("Failed to create {:?}: {}", self.config.dir, e)))?;

        let boundary = self.config.period.next_boundary(now);
        let (path, restarted) = self.resolve_path(start).await?;
        // A restart file covers the rest of the period; its own start keeps its job distinct
        let start = if restarted { now.trunc_subsecs(0) } else { start };
        let info = SegmentInfo {
            camera_id: self.config.camera_id.clone(),
            kind: self.config.kind,
            start,
            duration_secs: (boundary - start).num_seconds(),
            profile: self.config.profile,
            path: path.clone(),
        };

        let encoder = self.factory.open(&path, self.config.profile).await?;
        info!(
            "Camera {} opened {} {:?}",
            self.config.camera_id,
            self.config.kind.prefix(),
            path
        );

        Ok(OpenSegment {
            info,
            encoder,
            boundary,
        })
    }

    /// Canonical name for the period, unless a closed file already owns it. The flag is set
    /// for a restart name.
    async fn resolve_path(&self, start: DateTime<Utc>) -> Result<(PathBuf, bool), Error> {
        let ext = &self.config.extension;
        let canonical = self
            .config
            .dir
            .join(segment_file_name(self.config.kind, start, ext));

        if !exists(&canonical).await {
            return Ok((canonical, false));
        }
        if !exists(&completion_marker_path(&canonical)).await {
            // Left behind by a stopped or crashed writer; never marked, never enqueued
            warn!("Replacing unfinished file {:?}", canonical);
            tokio::fs::remove_file(&canonical)
                .await
                .map_err(|e| Error::Io(format!("Failed to remove {:?}: {}", canonical, e)))?;
            return Ok((canonical, false));
        }

        for restart in 1..=u32::MAX {
            let candidate = self
                .config
                .dir
                .join(restart_file_name(self.config.kind, start, ext, restart));
            if !exists(&candidate).await {
                return Ok((candidate, true));
            }
        }
        Err(Error::AlreadyExists(format!(
            "no free restart name for {:?}",
            canonical
        )))
    }
}

async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

async fn close_segment(
    info: SegmentInfo,
    encoder: Box<dyn FrameEncoder>,
    write_marker: bool,
) -> Option<SegmentInfo> {
    let frames = match encoder.finish().await {
        Ok(frames) => frames,
        Err(e) => {
            error!("Failed to close {:?}, leaving it unmarked: {}", info.path, e);
            return None;
        }
    };

    if write_marker {
        let marker = CompletionMarker {
            segment: info.clone(),
            frames,
            closed_at: Utc::now(),
        };
        if let Err(e) = write_completion_marker(&marker).await {
            error!("Failed to mark {:?} complete: {}", info.path, e);
            return None;
        }
    }

    info!("Closed {:?} with {} frames", info.path, frames);
    Some(info)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::recorder::segment::{is_marked_complete, read_completion_marker};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Writes one byte per frame so tests can count frames on disk
    #[derive(Default)]
    pub(crate) struct FakeEncoderFactory {
        pub opened: Mutex<Vec<PathBuf>>,
        pub fail_writes: std::sync::atomic::AtomicBool,
    }

    struct FakeEncoder {
        file: tokio::fs::File,
        frames: u64,
        fail: bool,
    }

    #[async_trait]
    impl EncoderFactory for FakeEncoderFactory {
        async fn open(
            &self,
            path: &Path,
            _profile: VideoProfile,
        ) -> Result<Box<dyn FrameEncoder>, Error> {
            self.opened.lock().unwrap().push(path.to_owned());
            let file = tokio::fs::File::create(path).await?;
            Ok(Box::new(FakeEncoder {
                file,
                frames: 0,
                fail: self.fail_writes.load(std::sync::atomic::Ordering::SeqCst),
            }))
        }
    }

    #[async_trait]
    impl FrameEncoder for FakeEncoder {
        async fn write_frame(&mut self, _image: &RgbImage) -> Result<(), Error> {
            use tokio::io::AsyncWriteExt;
            if self.fail {
                return Err(Error::Encoder("broken pipe".into()));
            }
            self.file.write_all(b"f").await?;
            self.frames += 1;
            Ok(())
        }

        async fn finish(mut self: Box<Self>) -> Result<u64, Error> {
            use tokio::io::AsyncWriteExt;
            self.file.flush().await?;
            Ok(self.frames)
        }
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, h, m, s).unwrap()
    }

    fn writer(dir: &Path, factory: Arc<FakeEncoderFactory>) -> SegmentWriter {
        SegmentWriter::new(
            SegmentWriterConfig {
                camera_id: "cam1".into(),
                kind: SegmentKind::Segment,
                period: RotationPeriod::from_secs(600).unwrap(),
                dir: dir.to_owned(),
                extension: "mp4".into(),
                profile: VideoProfile::new(4, 4, 5),
                completion_markers: true,
            },
            factory,
        )
    }

    fn frame() -> RgbImage {
        RgbImage::new(4, 4)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn rotating_writer_runs_on_a_spawned_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = writer(dir.path(), Arc::new(FakeEncoderFactory::default()));
        let image = frame();
        let write = async move {
            writer.write(at(14, 3, 0), &image).await.ok();
            writer.write(at(14, 10, 0), &image).await.ok();
            writer.finalize().await
        };
        assert_send(&write);
    }

    #[tokio::test]
    async fn rotates_on_the_wall_clock_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::default());
        let mut writer = writer(dir.path(), factory.clone());

        let first = writer.write(at(14, 3, 0), &frame()).await.unwrap();
        match first {
            WriteOutcome::Opened { opened, closed } => {
                assert_eq!(opened.start, at(14, 0, 0));
                assert!(closed.is_none());
            }
            other => panic!("expected a new file, got {:?}", other),
        }
        assert_eq!(
            writer.write(at(14, 9, 59), &frame()).await.unwrap(),
            WriteOutcome::Written
        );

        match writer.write(at(14, 10, 0), &frame()).await.unwrap() {
            WriteOutcome::Opened { opened, closed } => {
                assert_eq!(opened.start, at(14, 10, 0));
                assert_eq!(closed.unwrap().start, at(14, 0, 0));
            }
            other => panic!("expected rotation at 14:10, got {:?}", other),
        }

        let closed = writer.finalize().await;
        assert_eq!(closed.len(), 2);

        let first_path = dir.path().join("segment_20240517_140000.mp4");
        let second_path = dir.path().join("segment_20240517_141000.mp4");
        assert!(is_marked_complete(&first_path));
        assert!(is_marked_complete(&second_path));
        let marker = read_completion_marker(&first_path).await.unwrap().unwrap();
        assert_eq!(marker.frames, 2);
        assert_eq!(marker.segment.duration_secs, 600);
    }

    #[tokio::test]
    async fn restart_inside_a_closed_period_uses_a_restart_name() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::default());

        let mut first = writer(dir.path(), factory.clone());
        first.write(at(14, 1, 0), &frame()).await.unwrap();
        first.finalize().await;

        let mut second = writer(dir.path(), factory.clone());
        match second.write(at(14, 2, 0), &frame()).await.unwrap() {
            WriteOutcome::Opened { opened, .. } => {
                assert_eq!(
                    opened.path,
                    dir.path().join("segment_20240517_140000-r1.mp4")
                );
                assert_eq!(opened.start, at(14, 2, 0));
                assert_eq!(opened.nominal_end(), at(14, 10, 0));
            }
            other => panic!("expected a new file, got {:?}", other),
        }
        second.finalize().await;

        let marker = read_completion_marker(&dir.path().join("segment_20240517_140000-r1.mp4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.segment.start, at(14, 2, 0));

        // The closed original is untouched
        assert!(is_marked_complete(&dir.path().join("segment_20240517_140000.mp4")));
    }

    #[tokio::test]
    async fn unfinished_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("segment_20240517_140000.mp4");
        std::fs::write(&stale, b"half written").unwrap();

        let factory = Arc::new(FakeEncoderFactory::default());
        let mut writer = writer(dir.path(), factory.clone());
        writer.write(at(14, 5, 0), &frame()).await.unwrap();
        writer.finalize().await;

        assert_eq!(factory.opened.lock().unwrap().clone(), vec![stale.clone()]);
        assert_eq!(std::fs::read(&stale).unwrap(), b"f");
    }

    #[tokio::test]
    async fn failed_write_leaves_the_file_unmarked() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeEncoderFactory::default());
        factory
            .fail_writes
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let mut writer = writer(dir.path(), factory.clone());

        assert!(writer.write(at(14, 5, 0), &frame()).await.is_err());
        assert!(writer.current_segment().is_none());
        assert!(writer.finalize().await.is_empty());
        assert!(!is_marked_complete(&dir.path().join("segment_20240517_140000.mp4")));
    }
}
