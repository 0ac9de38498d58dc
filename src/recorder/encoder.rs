use crate::config::VideoProfile;
use crate::error::Error;
use async_trait::async_trait;
use image::RgbImage;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

/// Sink for the frames of one output file. `Sync` so a writer borrowed across an await stays
/// `Send`.
#[async_trait]
pub trait FrameEncoder: Send + Sync {
    async fn write_frame(&mut self, image: &RgbImage) -> Result<(), Error>;

    /// Flush and close the file. Returns the number of frames written.
    async fn finish(self: Box<Self>) -> Result<u64, Error>;
}

#[async_trait]
pub trait EncoderFactory: Send + Sync {
    async fn open(
        &self,
        path: &Path,
        profile: VideoProfile,
    ) -> Result<Box<dyn FrameEncoder>, Error>;
}

/// Encodes raw RGB24 frames to a file through an `ffmpeg` child process
pub struct FfmpegEncoderFactory {
    ffmpeg_path: PathBuf,
    format: String,
}

impl FfmpegEncoderFactory {
    pub fn new(ffmpeg_path: &Path, format: &str) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.to_owned(),
            format: format.to_string(),
        }
    }

    fn muxer(&self) -> &str {
        match self.format.as_str() {
            "mkv" => "matroska",
            "ts" => "mpegts",
            other => other,
        }
    }
}

/// Arguments reading raw frames of `profile` from stdin
pub(crate) fn rawvideo_input_args(profile: &VideoProfile) -> Vec<String> {
    vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "-s".into(),
        profile.resolution(),
        "-r".into(),
        profile.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
    ]
}

#[async_trait]
impl EncoderFactory for FfmpegEncoderFactory {
    async fn open(
        &self,
        path: &Path,
        profile: VideoProfile,
    ) -> Result<Box<dyn FrameEncoder>, Error> {
        let mut command = Command::new(&self.ffmpeg_path);
        command
            .args(rawvideo_input_args(&profile))
            .args([
                "-an",
                "-c:v",
                "libx264",
                "-preset",
                "veryfast",
                "-pix_fmt",
                "yuv420p",
                "-f",
                self.muxer(),
                "-y",
            ])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| Error::Encoder(format!("Failed to spawn encoder for {:?}: {}", path, e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Encoder(format!("Encoder for {:?} has no stdin", path)))?;

        debug!("Opened encoder for {:?} at {}@{}", path, profile.resolution(), profile.fps);

        Ok(Box::new(FfmpegFileEncoder {
            child,
            stdin: Some(stdin),
            profile,
            path: path.to_owned(),
            frames: 0,
        }))
    }
}

struct FfmpegFileEncoder {
    child: Child,
    stdin: Option<ChildStdin>,
    profile: VideoProfile,
    path: PathBuf,
    frames: u64,
}

#[async_trait]
impl FrameEncoder for FfmpegFileEncoder {
    async fn write_frame(&mut self, image: &RgbImage) -> Result<(), Error> {
        if image.width() != self.profile.width || image.height() != self.profile.height {
            return Err(Error::Encoder(format!(
                "frame is {}x{}, encoder expects {}",
                image.width(),
                image.height(),
                self.profile.resolution()
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Encoder(format!("Encoder for {:?} is closed", self.path)))?;
        stdin
            .write_all(image.as_raw())
            .await
            .map_err(|e| Error::Encoder(format!("Failed to write to {:?}: {}", self.path, e)))?;
        self.frames += 1;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, Error> {
        // Closing stdin lets the encoder write its trailer and exit
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.shutdown().await {
                warn!("Failed to close encoder input for {:?}: {}", self.path, e);
            }
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|e| Error::Encoder(format!("Failed to wait for encoder of {:?}: {}", self.path, e)))?;
        if !status.success() {
            return Err(Error::Encoder(format!(
                "Encoder for {:?} exited with {}",
                self.path, status
            )));
        }
        Ok(self.frames)
    }
}
