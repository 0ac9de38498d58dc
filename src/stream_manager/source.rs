//! Clip decoding and the endless source multiplexer.
//!
//! Everything in here is blocking and runs on the frame pipeline thread.

use crate::config::VideoProfile;
use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;

/// One entry of the clip pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClipSource {
    File(PathBuf),
    /// Synthetic moving pattern, `frames` long
    TestPattern { pattern: u32, frames: u32 },
}

impl std::fmt::Display for ClipSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClipSource::File(path) => write!(f, "{}", path.display()),
            ClipSource::TestPattern { pattern, frames } => {
                write!(f, "test-pattern-{} ({} frames)", pattern, frames)
            }
        }
    }
}

/// Decoder for a single clip, yielding frames at the ingest profile until exhausted
pub trait ClipDecoder: Send {
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Opens clip decoders
pub trait ClipOpener: Send + Sync {
    fn open(&self, clip: &ClipSource, ingest: &VideoProfile) -> Result<Box<dyn ClipDecoder>>;
}

/// Order in which the pool is walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClipOrder {
    Ordered,
    Shuffled,
}

/// Opens files through an `ffmpeg` child process emitting raw RGB24 at the ingest profile;
/// test patterns are generated in-process
pub struct FfmpegClipOpener {
    ffmpeg_path: PathBuf,
}

impl FfmpegClipOpener {
    pub fn new(ffmpeg_path: &Path) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_owned(),
        }
    }
}

impl ClipOpener for FfmpegClipOpener {
    fn open(&self, clip: &ClipSource, ingest: &VideoProfile) -> Result<Box<dyn ClipDecoder>> {
        match clip {
            ClipSource::File(path) => Ok(Box::new(FfmpegClipDecoder::spawn(
                &self.ffmpeg_path,
                path,
                *ingest,
            )?)),
            ClipSource::TestPattern { pattern, frames } => {
                Ok(Box::new(TestPatternDecoder::new(*pattern, *frames, *ingest)))
            }
        }
    }
}

struct FfmpegClipDecoder {
    child: Child,
    stdout: ChildStdout,
    profile: VideoProfile,
    path: PathBuf,
}

impl FfmpegClipDecoder {
    fn spawn(ffmpeg: &Path, path: &Path, profile: VideoProfile) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("clip {} does not exist", path.display()));
        }

        let filter = format!(
            "scale={}:{},fps={}",
            profile.width, profile.height, profile.fps
        );
        let mut child = Command::new(ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(path)
            .args([
                "-an", "-vf", filter.as_str(), "-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn decoder for {}", path.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("decoder for {} has no stdout", path.display()))?;

        debug!("Decoding clip {} at {}", path.display(), profile.resolution());

        Ok(Self {
            child,
            stdout,
            profile,
            path: path.to_owned(),
        })
    }
}

impl ClipDecoder for FfmpegClipDecoder {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        let mut buf = vec![0u8; self.profile.frame_len()];
        match self.stdout.read_exact(&mut buf) {
            Ok(()) => {}
            // A short tail at end of stream is a truncated frame, not an error
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(anyhow!(
                    "Failed to read frame from {}: {}",
                    self.path.display(),
                    e
                ))
            }
        }

        RgbImage::from_raw(self.profile.width, self.profile.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow!("decoder produced a frame of the wrong size"))
    }
}

impl Drop for FfmpegClipDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Moving gradient with a sweeping bar
pub struct TestPatternDecoder {
    pattern: u32,
    remaining: u32,
    tick: u32,
    profile: VideoProfile,
}

impl TestPatternDecoder {
    pub fn new(pattern: u32, frames: u32, profile: VideoProfile) -> Self {
        Self {
            pattern,
            remaining: frames,
            tick: 0,
            profile,
        }
    }
}

impl ClipDecoder for TestPatternDecoder {
    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let tick = self.tick;
        self.tick += 1;

        let (w, h) = (self.profile.width, self.profile.height);
        let bar = (tick * 4) % w.max(1);
        let tint = (self.pattern.wrapping_mul(53) % 256) as u8;
        let image = RgbImage::from_fn(w, h, |x, y| {
            if x.abs_diff(bar) < 4 {
                Rgb([255, 255, 255])
            } else {
                Rgb([
                    ((x * 255) / w.max(1)) as u8,
                    ((y * 255) / h.max(1)) as u8,
                    tint,
                ])
            }
        });
        Ok(Some(image))
    }
}

/// Concatenates a pool of clips into an endless feed.
///
/// Exhausted clips are replaced by the next one in the pass; a new pass starts when the pool
/// is used up (reshuffled when shuffling). Clips that fail to open are skipped, and the feed
/// only fails when a whole pass produced no frame at all.
pub struct SourceMultiplexer {
    clips: Vec<ClipSource>,
    order: ClipOrder,
    ingest: VideoProfile,
    opener: Arc<dyn ClipOpener>,
    rng: StdRng,
    pass: Vec<usize>,
    position: usize,
    current: Option<(usize, Box<dyn ClipDecoder>)>,
    last_played: Option<usize>,
    clips_started: u64,
}

impl SourceMultiplexer {
    pub fn new(
        clips: Vec<ClipSource>,
        order: ClipOrder,
        ingest: VideoProfile,
        opener: Arc<dyn ClipOpener>,
    ) -> Result<Self> {
        Self::with_rng(clips, order, ingest, opener, StdRng::from_entropy())
    }

    pub fn with_rng(
        clips: Vec<ClipSource>,
        order: ClipOrder,
        ingest: VideoProfile,
        opener: Arc<dyn ClipOpener>,
        rng: StdRng,
    ) -> Result<Self> {
        if clips.is_empty() {
            return Err(anyhow!("source multiplexer needs at least one clip"));
        }
        Ok(Self {
            clips,
            order,
            ingest,
            opener,
            rng,
            pass: Vec::new(),
            position: 0,
            current: None,
            last_played: None,
            clips_started: 0,
        })
    }

    pub fn clips_started(&self) -> u64 {
        self.clips_started
    }

    /// Next frame of the feed; never returns end-of-stream
    pub fn next_frame(&mut self) -> Result<RgbImage> {
        let mut attempts_without_frame = 0usize;

        loop {
            if let Some((index, decoder)) = self.current.as_mut() {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if frame.width() != self.ingest.width
                            || frame.height() != self.ingest.height
                        {
                            return Err(anyhow!(
                                "clip {} produced {}x{} instead of {}",
                                self.clips[*index],
                                frame.width(),
                                frame.height(),
                                self.ingest.resolution()
                            ));
                        }
                        return Ok(frame);
                    }
                    Ok(None) => {
                        debug!("Clip {} exhausted", self.clips[*index]);
                    }
                    Err(e) => {
                        warn!("Clip {} failed mid-stream: {}", self.clips[*index], e);
                    }
                }
                self.current = None;
                attempts_without_frame += 1;
            }

            if attempts_without_frame > self.clips.len() {
                return Err(anyhow!(
                    "none of the {} clips produced a frame in a full pass",
                    self.clips.len()
                ));
            }

            let index = self.next_clip_index();
            match self.opener.open(&self.clips[index], &self.ingest) {
                Ok(decoder) => {
                    self.clips_started += 1;
                    self.last_played = Some(index);
                    info!("Switching feed to clip {}", self.clips[index]);
                    self.current = Some((index, decoder));
                }
                Err(e) => {
                    warn!("Skipping clip {}: {}", self.clips[index], e);
                    attempts_without_frame += 1;
                }
            }
        }
    }

    fn next_clip_index(&mut self) -> usize {
        if self.position >= self.pass.len() {
            self.start_pass();
        }
        let index = self.pass[self.position];
        self.position += 1;
        index
    }

    fn start_pass(&mut self) {
        self.pass = (0..self.clips.len()).collect();
        if self.order == ClipOrder::Shuffled {
            self.pass.shuffle(&mut self.rng);
            // Avoid playing the same clip twice in a row across passes
            if self.pass.len() > 1 && Some(self.pass[0]) == self.last_played {
                let last = self.pass.len() - 1;
                self.pass.swap(0, last);
            }
        }
        self.position = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    const PROFILE: VideoProfile = VideoProfile::new(16, 8, 10);

    /// Opens test patterns and records the order clips were opened in
    struct RecordingOpener {
        opened: Mutex<Vec<ClipSource>>,
        broken: Vec<ClipSource>,
    }

    impl RecordingOpener {
        fn new(broken: Vec<ClipSource>) -> Self {
            Self {
                opened: Mutex::new(Vec::new()),
                broken,
            }
        }
    }

    impl ClipOpener for RecordingOpener {
        fn open(&self, clip: &ClipSource, ingest: &VideoProfile) -> Result<Box<dyn ClipDecoder>> {
            if self.broken.contains(clip) {
                return Err(anyhow!("broken clip"));
            }
            self.opened.lock().unwrap().push(clip.clone());
            match clip {
                ClipSource::TestPattern { pattern, frames } => {
                    Ok(Box::new(TestPatternDecoder::new(*pattern, *frames, *ingest)))
                }
                ClipSource::File(_) => Err(anyhow!("files are not supported here")),
            }
        }
    }

    fn pool(n: u32) -> Vec<ClipSource> {
        (0..n)
            .map(|pattern| ClipSource::TestPattern { pattern, frames: 3 })
            .collect()
    }

    #[test]
    fn ordered_feed_loops_forever() {
        let opener = Arc::new(RecordingOpener::new(vec![]));
        let mut mux =
            SourceMultiplexer::new(pool(2), ClipOrder::Ordered, PROFILE, opener.clone()).unwrap();

        for _ in 0..12 {
            let frame = mux.next_frame().unwrap();
            assert_eq!((frame.width(), frame.height()), (16, 8));
        }

        let clips = pool(2);
        let opened = opener.opened.lock().unwrap().clone();
        assert_eq!(
            opened,
            vec![
                clips[0].clone(),
                clips[1].clone(),
                clips[0].clone(),
                clips[1].clone()
            ]
        );
        assert_eq!(mux.clips_started(), 4);
    }

    #[test]
    fn shuffled_pass_covers_every_clip() {
        let opener = Arc::new(RecordingOpener::new(vec![]));
        let mut mux = SourceMultiplexer::with_rng(
            pool(5),
            ClipOrder::Shuffled,
            PROFILE,
            opener.clone(),
            StdRng::seed_from_u64(7),
        )
        .unwrap();

        for _ in 0..15 {
            mux.next_frame().unwrap();
        }

        let opened = opener.opened.lock().unwrap().clone();
        let distinct: HashSet<String> = opened.iter().map(|c| c.to_string()).collect();
        assert_eq!(opened.len(), 5);
        assert_eq!(distinct.len(), 5);
    }

    #[test]
    fn broken_clips_are_skipped() {
        let clips = pool(3);
        let opener = Arc::new(RecordingOpener::new(vec![clips[1].clone()]));
        let mut mux =
            SourceMultiplexer::new(clips.clone(), ClipOrder::Ordered, PROFILE, opener.clone())
                .unwrap();

        for _ in 0..6 {
            mux.next_frame().unwrap();
        }
        let opened = opener.opened.lock().unwrap().clone();
        assert_eq!(opened, vec![clips[0].clone(), clips[2].clone()]);
    }

    #[test]
    fn feed_fails_when_nothing_decodes() {
        let clips = pool(2);
        let opener = Arc::new(RecordingOpener::new(clips.clone()));
        let mut mux = SourceMultiplexer::new(clips, ClipOrder::Ordered, PROFILE, opener).unwrap();
        assert!(mux.next_frame().is_err());
    }

    #[test]
    fn empty_pool_is_rejected() {
        let opener = Arc::new(RecordingOpener::new(vec![]));
        assert!(SourceMultiplexer::new(vec![], ClipOrder::Ordered, PROFILE, opener).is_err());
    }
}
