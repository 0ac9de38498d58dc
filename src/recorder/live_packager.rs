use crate::config::{LiveConfig, VideoProfile};
use crate::error::Error;
use crate::recorder::encoder::{rawvideo_input_args, FrameEncoder};
use crate::recorder::playlist::{
    chunk_file_name, parse_chunk_list_line, parse_chunk_sequence, ChunkListEntry, LivePlaylist,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::RgbImage;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Parameters of one live encoder run
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub camera_id: String,
    pub dir: PathBuf,
    pub profile: VideoProfile,
    pub chunk_duration_secs: u32,
    /// Sequence number of the first chunk, continuing across restarts
    pub start_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Chunk(ChunkListEntry),
    /// The encoder process is gone
    Exited(String),
}

/// A running live encoder: frames go in through `input`, finished chunks come out of `events`
pub struct LiveEncoderSession {
    pub input: Box<dyn FrameEncoder>,
    pub events: mpsc::Receiver<EncoderEvent>,
    /// Cancelling kills the encoder
    pub kill: CancellationToken,
}

#[async_trait]
pub trait LiveEncoderLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<LiveEncoderSession, Error>;
}

/// Runs `ffmpeg` with the segment muxer and reads the chunk list it prints on stdout
pub struct FfmpegLiveLauncher {
    ffmpeg_path: PathBuf,
}

impl FfmpegLiveLauncher {
    pub fn new(ffmpeg_path: &Path) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_owned(),
        }
    }
}

#[async_trait]
impl LiveEncoderLauncher for FfmpegLiveLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<LiveEncoderSession, Error> {
        let gop = (request.profile.fps * request.chunk_duration_secs).max(1).to_string();
        let chunk = request.chunk_duration_secs.to_string();
        let start_number = request.start_number.to_string();
        let pattern = request.dir.join(format!("{}_%d.ts", request.camera_id));

        let mut child = Command::new(&self.ffmpeg_path)
            .args(rawvideo_input_args(&request.profile))
            .args([
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-tune",
                "zerolatency",
                "-pix_fmt",
                "yuv420p",
                "-g",
                gop.as_str(),
                "-keyint_min",
                gop.as_str(),
                "-sc_threshold",
                "0",
                "-f",
                "segment",
                "-segment_time",
                chunk.as_str(),
                "-segment_format",
                "mpegts",
                "-segment_start_number",
                start_number.as_str(),
                "-segment_list",
                "pipe:1",
                "-segment_list_type",
                "csv",
                "-reset_timestamps",
                "0",
            ])
            .arg(&pattern)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Encoder(format!("Failed to spawn live encoder: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder("live encoder has no stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Encoder("live encoder has no stdout".into()))?;

        let (tx, events) = mpsc::channel(32);
        let kill = CancellationToken::new();
        let kill_signal = kill.clone();
        let camera_id = request.camera_id.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = kill_signal.cancelled() => {
                        let _ = child.start_kill();
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parse_chunk_list_line(&line) {
                            Some(entry) => {
                                if tx.send(EncoderEvent::Chunk(entry)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                debug!("Ignoring chunk list line for {}: {:?}", camera_id, line)
                            }
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!("Failed to read chunk list of {}: {}", camera_id, e);
                            break;
                        }
                    }
                }
            }

            let reason = match child.wait().await {
                Ok(status) => format!("encoder exited with {}", status),
                Err(e) => format!("failed to wait for encoder: {}", e),
            };
            let _ = tx.send(EncoderEvent::Exited(reason)).await;
        });

        info!(
            "Live encoder for {} started at chunk {}",
            request.camera_id, request.start_number
        );

        Ok(LiveEncoderSession {
            input: Box::new(PipeInput {
                stdin: Some(stdin),
                frames: 0,
            }),
            events,
            kill,
        })
    }
}

struct PipeInput {
    stdin: Option<ChildStdin>,
    frames: u64,
}

#[async_trait]
impl FrameEncoder for PipeInput {
    async fn write_frame(&mut self, image: &RgbImage) -> Result<(), Error> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Encoder("live encoder input is closed".into()))?;
        stdin
            .write_all(image.as_raw())
            .await
            .map_err(|e| Error::Encoder(format!("Failed to feed live encoder: {}", e)))?;
        self.frames += 1;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, Error> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin
                .shutdown()
                .await
                .map_err(|e| Error::Encoder(format!("Failed to close live encoder input: {}", e)))?;
        }
        Ok(self.frames)
    }
}

/// Snapshot of a packager
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub encoder_running: bool,
    pub restarts: u64,
    pub dropped_frames: u64,
    pub media_sequence: u64,
    pub chunks_advertised: usize,
    pub last_chunk_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    restarts: AtomicU64,
    dropped_frames: AtomicU64,
    running: std::sync::atomic::AtomicBool,
}

/// Feeds the live track to a supervised encoder and maintains the rolling playlist
pub struct LivePackager {
    camera_id: String,
    dir: PathBuf,
    frames: mpsc::Sender<Arc<RgbImage>>,
    playlist: Arc<RwLock<LivePlaylist>>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LivePackager {
    pub fn start(
        camera_id: &str,
        dir: &Path,
        profile: VideoProfile,
        config: &LiveConfig,
        launcher: Arc<dyn LiveEncoderLauncher>,
        cancel: CancellationToken,
    ) -> Self {
        let (frames, frames_rx) = mpsc::channel(config.frame_buffer.max(1));
        let playlist = Arc::new(RwLock::new(LivePlaylist::new(
            config.window_size,
            config.chunk_duration_secs,
        )));
        let counters = Arc::new(Counters::default());

        let supervisor = Supervisor {
            request: LaunchRequest {
                camera_id: camera_id.to_string(),
                dir: dir.to_owned(),
                profile,
                chunk_duration_secs: config.chunk_duration_secs.max(1),
                start_number: 0,
            },
            config: config.clone(),
            launcher,
            playlist: playlist.clone(),
            counters: counters.clone(),
            frames: frames_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(supervisor.run());

        Self {
            camera_id: camera_id.to_string(),
            dir: dir.to_owned(),
            frames,
            playlist,
            counters,
            cancel,
            task: std::sync::Mutex::new(Some(task)),
        }
    }

    /// Hand a frame to the encoder without waiting. Frames are dropped when the encoder is
    /// behind or restarting.
    pub fn push_frame(&self, image: Arc<RgbImage>) -> bool {
        match self.frames.try_send(image) {
            Ok(()) => true,
            Err(_) => {
                self.counters.dropped_frames.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub async fn manifest(&self) -> Option<String> {
        let playlist = self.playlist.read().await;
        (!playlist.is_empty()).then(|| playlist.render())
    }

    /// Whether `file_name` is a chunk currently advertised by the manifest
    pub async fn is_advertised(&self, file_name: &str) -> bool {
        self.playlist.read().await.contains_uri(file_name)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn status(&self) -> LiveStatus {
        let playlist = self.playlist.read().await;
        LiveStatus {
            encoder_running: self.counters.running.load(Ordering::Relaxed),
            restarts: self.counters.restarts.load(Ordering::Relaxed),
            dropped_frames: self.counters.dropped_frames.load(Ordering::Relaxed),
            media_sequence: playlist.media_sequence(),
            chunks_advertised: playlist.len(),
            last_chunk_at: playlist.live_edge().map(|entry| entry.added_at),
        }
    }

    /// Stop the encoder after it flushed its last chunk
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Live packager for {} panicked: {}", self.camera_id, e);
            }
        }
    }
}

enum SessionEnd {
    Cancelled,
    Failed(String),
}

struct Supervisor {
    request: LaunchRequest,
    config: LiveConfig,
    launcher: Arc<dyn LiveEncoderLauncher>,
    playlist: Arc<RwLock<LivePlaylist>>,
    counters: Arc<Counters>,
    frames: mpsc::Receiver<Arc<RgbImage>>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        let initial_backoff = Duration::from_millis(self.config.restart_backoff_ms.max(1));
        let max_backoff = Duration::from_millis(
            self.config
                .max_restart_backoff_ms
                .max(self.config.restart_backoff_ms.max(1)),
        );
        let mut backoff = initial_backoff;
        let mut launched_before = false;

        if let Err(e) = tokio::fs::create_dir_all(&self.request.dir).await {
            error!("Failed to create live dir {:?}: {}", self.request.dir, e);
        }

        while !self.cancel.is_cancelled() {
            // Frames queued while the encoder was down are stale
            while self.frames.try_recv().is_ok() {}

            let session = match self.launcher.launch(&self.request).await {
                Ok(session) => session,
                Err(e) => {
                    error!(
                        "Failed to launch live encoder for {}: {}",
                        self.request.camera_id, e
                    );
                    if !self.pause(&mut backoff, max_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            if launched_before {
                self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                self.playlist.write().await.mark_discontinuity();
            }
            launched_before = true;
            self.counters.running.store(true, Ordering::Relaxed);

            let end = self.run_session(session, &mut backoff, initial_backoff).await;
            self.counters.running.store(false, Ordering::Relaxed);

            match end {
                SessionEnd::Cancelled => break,
                SessionEnd::Failed(reason) => {
                    error!(
                        "Live encoder for {} stopped unexpectedly ({}), restarting at chunk {}",
                        self.request.camera_id, reason, self.request.start_number
                    );
                    if !self.pause(&mut backoff, max_backoff).await {
                        break;
                    }
                }
            }
        }

        info!("Live packager for {} stopped", self.request.camera_id);
    }

    /// Sleep for the current backoff and double it. Returns false when cancelled meanwhile.
    async fn pause(&self, backoff: &mut Duration, max_backoff: Duration) -> bool {
        let wait = *backoff;
        *backoff = (*backoff * 2).min(max_backoff);
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }

    fn stall_timeout(&self) -> Duration {
        Duration::from_secs((self.request.chunk_duration_secs as u64 * 5).max(10))
    }

    async fn run_session(
        &mut self,
        session: LiveEncoderSession,
        backoff: &mut Duration,
        initial_backoff: Duration,
    ) -> SessionEnd {
        let LiveEncoderSession {
            mut input,
            mut events,
            kill,
        } = session;
        let stall_timeout = self.stall_timeout();
        let mut deadline = Instant::now() + stall_timeout;

        let end = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break SessionEnd::Cancelled,
                frame = self.frames.recv() => {
                    let Some(frame) = frame else {
                        break SessionEnd::Cancelled;
                    };
                    if let Err(e) = input.write_frame(&frame).await {
                        break SessionEnd::Failed(e.to_string());
                    }
                }
                event = events.recv() => match event {
                    Some(EncoderEvent::Chunk(entry)) => {
                        self.publish(entry).await;
                        *backoff = initial_backoff;
                        deadline = Instant::now() + stall_timeout;
                    }
                    Some(EncoderEvent::Exited(reason)) => break SessionEnd::Failed(reason),
                    None => break SessionEnd::Failed("encoder event stream closed".into()),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    break SessionEnd::Failed(format!(
                        "no chunk produced in {}s",
                        stall_timeout.as_secs()
                    ));
                }
            }
        };

        match end {
            SessionEnd::Cancelled => {
                // Let the encoder flush its last chunk before it is killed
                if let Err(e) = input.finish().await {
                    debug!("{}", e);
                }
                let drain = async {
                    while let Some(EncoderEvent::Chunk(entry)) = events.recv().await {
                        self.publish(entry).await;
                    }
                };
                let _ = tokio::time::timeout(Duration::from_secs(5), drain).await;
            }
            SessionEnd::Failed(_) => {
                drop(input);
                // Chunks announced before the failure are complete, keep the numbering contiguous
                while let Ok(EncoderEvent::Chunk(entry)) = events.try_recv() {
                    self.publish(entry).await;
                }
            }
        }
        kill.cancel();
        end
    }

    async fn publish(&mut self, entry: ChunkListEntry) {
        let camera_id = &self.request.camera_id;
        let sequence = match parse_chunk_sequence(camera_id, &entry.file_name) {
            Some(sequence) => sequence,
            None => {
                warn!("Unexpected live chunk name {:?}", entry.file_name);
                return;
            }
        };
        self.request.start_number = self.request.start_number.max(sequence + 1);

        let (pruned, manifest) = {
            let mut playlist = self.playlist.write().await;
            let pruned = playlist.push(
                sequence,
                chunk_file_name(camera_id, sequence),
                entry.duration(),
                Utc::now(),
            );
            (pruned, playlist.render())
        };
        debug!("Camera {} live chunk {} ready", camera_id, sequence);

        if let Err(e) = write_manifest(&self.request.dir, camera_id, &manifest).await {
            warn!("Failed to write live manifest for {}: {}", camera_id, e);
        }

        if self.config.delete_pruned {
            for old in pruned {
                let path = self.request.dir.join(&old.uri);
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("Failed to delete pruned chunk {:?}: {}", path, e);
                    }
                }
            }
        }
    }
}

/// `<dir>/<camera_id>.m3u8`, replaced atomically
async fn write_manifest(dir: &Path, camera_id: &str, manifest: &str) -> Result<(), Error> {
    let path = dir.join(format!("{}.m3u8", camera_id));
    let tmp = dir.join(format!(".{}.m3u8.tmp", camera_id));
    tokio::fs::write(&tmp, manifest).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Each launch gets a scripted encoder: it turns every `frames_per_chunk` frames into a
    /// chunk file and can be told to die after a number of chunks
    struct FakeLauncher {
        frames_per_chunk: u64,
        die_after_chunks: Mutex<Vec<Option<u64>>>,
        launches: Mutex<Vec<u64>>,
    }

    struct FakeInput {
        tx: mpsc::UnboundedSender<()>,
        frames: u64,
    }

    #[async_trait]
    impl FrameEncoder for FakeInput {
        async fn write_frame(&mut self, _image: &RgbImage) -> Result<(), Error> {
            self.tx
                .send(())
                .map_err(|_| Error::Encoder("fake encoder is gone".into()))?;
            self.frames += 1;
            Ok(())
        }

        async fn finish(self: Box<Self>) -> Result<u64, Error> {
            Ok(self.frames)
        }
    }

    #[async_trait]
    impl LiveEncoderLauncher for FakeLauncher {
        async fn launch(&self, request: &LaunchRequest) -> Result<LiveEncoderSession, Error> {
            self.launches.lock().unwrap().push(request.start_number);
            let die_after = {
                let mut plan = self.die_after_chunks.lock().unwrap();
                if plan.is_empty() {
                    None
                } else {
                    plan.remove(0)
                }
            };

            let (frame_tx, mut frame_rx) = mpsc::unbounded_channel();
            let (tx, events) = mpsc::channel(8);
            let request = request.clone();
            let per_chunk = self.frames_per_chunk;
            tokio::spawn(async move {
                let mut frames = 0;
                let mut seq = request.start_number;
                let mut produced = 0;
                while frame_rx.recv().await.is_some() {
                    frames += 1;
                    if frames % per_chunk == 0 {
                        let name = chunk_file_name(&request.camera_id, seq);
                        tokio::fs::write(request.dir.join(&name), b"ts").await.unwrap();
                        let entry = ChunkListEntry {
                            file_name: name,
                            start_secs: seq as f64 * 2.0,
                            end_secs: seq as f64 * 2.0 + 2.0,
                        };
                        if tx.send(EncoderEvent::Chunk(entry)).await.is_err() {
                            return;
                        }
                        seq += 1;
                        produced += 1;
                        if Some(produced) == die_after {
                            let _ = tx.send(EncoderEvent::Exited("killed".into())).await;
                            return;
                        }
                    }
                }
            });

            Ok(LiveEncoderSession {
                input: Box::new(FakeInput {
                    tx: frame_tx,
                    frames: 0,
                }),
                events,
                kill: CancellationToken::new(),
            })
        }
    }

    fn config(window: usize) -> LiveConfig {
        LiveConfig {
            window_size: window,
            restart_backoff_ms: 10,
            max_restart_backoff_ms: 20,
            frame_buffer: 4,
            ..LiveConfig::default()
        }
    }

    async fn feed_until<F>(packager: &LivePackager, mut done: F)
    where
        F: FnMut(&LiveStatus) -> bool,
    {
        let frame = Arc::new(RgbImage::new(2, 2));
        for _ in 0..2000 {
            packager.push_frame(frame.clone());
            tokio::time::sleep(Duration::from_millis(1)).await;
            if done(&packager.status().await) {
                return;
            }
        }
        panic!("packager never reached the expected state");
    }

    #[tokio::test]
    async fn window_rolls_and_old_chunks_are_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher {
            frames_per_chunk: 2,
            die_after_chunks: Mutex::new(vec![]),
            launches: Mutex::new(vec![]),
        });
        let packager = LivePackager::start(
            "cam1",
            dir.path(),
            VideoProfile::new(2, 2, 1),
            &config(3),
            launcher,
            CancellationToken::new(),
        );

        feed_until(&packager, |status| status.media_sequence >= 5).await;

        let manifest = packager.manifest().await.unwrap();
        assert!(!manifest.contains("cam1_0.ts"));
        assert!(!dir.path().join("cam1_0.ts").exists());
        assert!(dir.path().join("cam1.m3u8").exists());
        assert_eq!(packager.status().await.chunks_advertised, 3);
        packager.shutdown().await;
    }

    #[tokio::test]
    async fn dead_encoder_is_restarted_with_continuing_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = Arc::new(FakeLauncher {
            frames_per_chunk: 1,
            die_after_chunks: Mutex::new(vec![Some(2)]),
            launches: Mutex::new(vec![]),
        });
        let packager = LivePackager::start(
            "cam1",
            dir.path(),
            VideoProfile::new(2, 2, 1),
            &config(10),
            launcher.clone(),
            CancellationToken::new(),
        );

        feed_until(&packager, |status| {
            status.restarts >= 1 && status.media_sequence == 0 && status.chunks_advertised >= 4
        })
        .await;

        let launches = launcher.launches.lock().unwrap().clone();
        assert_eq!(&launches[..2], &[0, 2]);
        let manifest = packager.manifest().await.unwrap();
        assert!(manifest.contains("#EXT-X-DISCONTINUITY\n#EXTINF:2.000,\ncam1_2.ts"));
        packager.shutdown().await;
    }
}
