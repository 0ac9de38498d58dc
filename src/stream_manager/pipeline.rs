//! Decode and resample on a dedicated thread.
//!
//! The pipeline thread pulls frames from the source multiplexer at the ingest profile and
//! derives the live, segment and archive tracks from them. It never touches the async runtime
//! except through the bounded channel, so heavy decode and resize work cannot stall it.

use crate::config::{PipelineConfig, VideoProfile};
use crate::error::Error;
use crate::stream_manager::source::SourceMultiplexer;
use image::imageops::{self, FilterType};
use image::RgbImage;
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;

/// Picks frames for a slower track and scales them to its resolution
#[derive(Debug, Clone)]
pub struct TrackResampler {
    target: VideoProfile,
    ingest_fps: u64,
}

impl TrackResampler {
    pub fn new(ingest: &VideoProfile, target: VideoProfile) -> Self {
        Self {
            target,
            ingest_fps: ingest.fps.max(1) as u64,
        }
    }

    /// Whether ingest frame `index` belongs to the target track. Spreads the kept frames
    /// evenly; a target faster than the ingest keeps every frame.
    pub fn selects(&self, index: u64) -> bool {
        let out = (self.target.fps as u64).min(self.ingest_fps);
        (index + 1) * out / self.ingest_fps > index * out / self.ingest_fps
    }

    pub fn resample(&self, index: u64, image: &RgbImage) -> Option<RgbImage> {
        if !self.selects(index) {
            return None;
        }
        if image.width() == self.target.width && image.height() == self.target.height {
            return Some(image.clone());
        }
        Some(imageops::resize(
            image,
            self.target.width,
            self.target.height,
            FilterType::Triangle,
        ))
    }
}

/// Frames for every track derived from one ingest frame
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub sequence: u64,
    pub live: Option<Arc<RgbImage>>,
    pub segment: Option<Arc<RgbImage>>,
    pub archive: Option<Arc<RgbImage>>,
}

#[derive(Debug)]
pub enum PipelineEvent {
    Frame(PipelineOutput),
    /// The source cannot produce frames anymore
    Failed(String),
}

pub struct FramePipeline {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FramePipeline {
    pub fn spawn(
        camera_id: &str,
        config: &PipelineConfig,
        archive_enabled: bool,
        mut source: SourceMultiplexer,
    ) -> Result<(Self, mpsc::Receiver<PipelineEvent>), Error> {
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let stop = Arc::new(AtomicBool::new(false));

        let live = TrackResampler::new(&config.ingest, config.live);
        let segment = TrackResampler::new(&config.ingest, config.segment);
        let archive = archive_enabled.then(|| TrackResampler::new(&config.ingest, config.archive));
        let stop_flag = stop.clone();
        let name = camera_id.to_string();

        let thread = std::thread::Builder::new()
            .name(format!("pipeline-{}", camera_id))
            .spawn(move || {
                info!("Frame pipeline for {} started", name);
                let mut sequence = 0u64;
                while !stop_flag.load(Ordering::Relaxed) {
                    let frame = match source.next_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            error!("Frame source for {} failed: {}", name, e);
                            let _ = tx.blocking_send(PipelineEvent::Failed(e.to_string()));
                            break;
                        }
                    };

                    let output = PipelineOutput {
                        sequence,
                        live: live.resample(sequence, &frame).map(Arc::new),
                        segment: segment.resample(sequence, &frame).map(Arc::new),
                        archive: archive
                            .as_ref()
                            .and_then(|track| track.resample(sequence, &frame))
                            .map(Arc::new),
                    };
                    sequence += 1;

                    // Fails once the stream loop dropped the receiver
                    if tx.blocking_send(PipelineEvent::Frame(output)).is_err() {
                        break;
                    }
                }
                debug!("Frame pipeline for {} exited after {} frames", name, sequence);
            })
            .map_err(|e| Error::Stream(format!("Failed to spawn pipeline thread: {}", e)))?;

        Ok((
            Self {
                stop,
                thread: Some(thread),
            },
            rx,
        ))
    }

    /// Ask the thread to exit. It notices at its next frame or when the receiver is dropped.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
        // Detached on purpose; joining here could block the runtime while a decoder is busy
        self.thread.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_manager::source::{ClipOrder, ClipSource, FfmpegClipOpener};
    use std::path::Path;

    #[test]
    fn decimation_keeps_the_target_rate() {
        let ingest = VideoProfile::new(16, 16, 15);
        let segment = TrackResampler::new(&ingest, VideoProfile::new(8, 8, 5));
        let kept = (0..150).filter(|i| segment.selects(*i)).count();
        assert_eq!(kept, 50);

        let archive = TrackResampler::new(&ingest, VideoProfile::new(8, 8, 2));
        assert_eq!((0..150).filter(|i| archive.selects(*i)).count(), 20);

        let live = TrackResampler::new(&ingest, VideoProfile::new(16, 16, 30));
        assert!((0..15).all(|i| live.selects(i)));
    }

    #[test]
    fn resample_scales_to_the_track_resolution() {
        let ingest = VideoProfile::new(16, 8, 1);
        let track = TrackResampler::new(&ingest, VideoProfile::new(4, 2, 1));
        let scaled = track.resample(0, &RgbImage::new(16, 8)).unwrap();
        assert_eq!((scaled.width(), scaled.height()), (4, 2));
    }

    #[tokio::test]
    async fn pipeline_thread_feeds_every_track() {
        let config = PipelineConfig {
            ingest: VideoProfile::new(16, 8, 4),
            live: VideoProfile::new(16, 8, 4),
            segment: VideoProfile::new(8, 4, 2),
            archive: VideoProfile::new(4, 2, 1),
            buffer: 2,
        };
        let source = SourceMultiplexer::new(
            vec![ClipSource::TestPattern {
                pattern: 1,
                frames: 3,
            }],
            ClipOrder::Ordered,
            config.ingest,
            Arc::new(FfmpegClipOpener::new(Path::new("ffmpeg"))),
        )
        .unwrap();

        let (mut pipeline, mut rx) = FramePipeline::spawn("cam1", &config, true, source).unwrap();
        let mut counts = (0, 0, 0);
        for expected in 0..8u64 {
            match rx.recv().await.unwrap() {
                PipelineEvent::Frame(out) => {
                    assert_eq!(out.sequence, expected);
                    counts.0 += out.live.is_some() as u32;
                    counts.1 += out.segment.is_some() as u32;
                    counts.2 += out.archive.is_some() as u32;
                }
                PipelineEvent::Failed(e) => panic!("pipeline failed: {}", e),
            }
        }
        pipeline.stop();

        assert_eq!(counts, (8, 4, 2));
    }
}
