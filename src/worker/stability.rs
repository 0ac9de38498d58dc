//! Checks that a segment file is finished before it is analyzed.
//!
//! A file is stable when it exists, carries its completion marker (when markers are
//! required), was last modified long enough ago, meets the size floor and yields a first
//! video packet.

use crate::error::Error;
use crate::recorder::segment::completion_marker_path;
use crate::worker::JobError;
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::process::Command;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Stable { size: u64 },
    Missing,
    /// The writer has not closed the file yet
    MarkerMissing,
    TooFresh { age: Duration },
    TooSmall { size: u64 },
    Undecodable(String),
}

impl ProbeVerdict {
    pub fn is_stable(&self) -> bool {
        matches!(self, ProbeVerdict::Stable { .. })
    }
}

impl std::fmt::Display for ProbeVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeVerdict::Stable { size } => write!(f, "stable ({} bytes)", size),
            ProbeVerdict::Missing => write!(f, "file does not exist"),
            ProbeVerdict::MarkerMissing => write!(f, "completion marker missing"),
            ProbeVerdict::TooFresh { age } => write!(f, "modified {:.1}s ago", age.as_secs_f64()),
            ProbeVerdict::TooSmall { size } => write!(f, "only {} bytes", size),
            ProbeVerdict::Undecodable(reason) => write!(f, "not decodable: {}", reason),
        }
    }
}

/// Verifies a file opens as a media stream
#[async_trait]
pub trait DecodeCheck: Send + Sync {
    async fn check(&self, path: &Path) -> Result<(), String>;
}

/// Opens the file with `ffprobe` and reads its first video packet
pub struct FfprobeCheck {
    ffprobe_path: PathBuf,
    timeout: Duration,
}

impl FfprobeCheck {
    pub fn new(ffprobe_path: &Path, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.to_owned(),
            timeout,
        }
    }

    /// Fails when the binary cannot be run at all, so a misconfigured worker stops before it
    /// starts failing jobs
    pub async fn ensure_available(&self) -> Result<(), Error> {
        let status = Command::new(&self.ffprobe_path)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| Error::Config(format!("Cannot run {:?}: {}", self.ffprobe_path, e)))?;
        if !status.success() {
            return Err(Error::Config(format!(
                "{:?} -version exited with {}",
                self.ffprobe_path, status
            )));
        }
        Ok(())
    }

    fn command(&self, path: &Path) -> Command {
        let mut command = Command::new(&self.ffprobe_path);
        command
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-read_intervals",
                "%+#1",
                "-show_entries",
                "packet=pts_time,size",
                "-of",
                "csv=p=0",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl DecodeCheck for FfprobeCheck {
    async fn check(&self, path: &Path) -> Result<(), String> {
        let output = tokio::time::timeout(self.timeout, self.command(path).output())
            .await
            .map_err(|_| format!("ffprobe did not finish within {:?}", self.timeout))?
            .map_err(|e| format!("Failed to run {:?}: {}", self.ffprobe_path, e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("ffprobe exited with {}: {}", output.status, stderr.trim()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().map(str::trim).find(|line| !line.is_empty()) {
            Some(packet) => {
                debug!("{:?} first video packet: {}", path, packet);
                Ok(())
            }
            None => Err("no video packet could be read".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StabilitySettings {
    pub min_age: Duration,
    pub min_bytes: u64,
    pub require_marker: bool,
    /// How long [`StabilityProbe::wait_until_stable`] keeps polling
    pub timeout: Duration,
    pub poll: Duration,
}

pub struct StabilityProbe {
    settings: StabilitySettings,
    decoder: Arc<dyn DecodeCheck>,
}

impl StabilityProbe {
    pub fn new(settings: StabilitySettings, decoder: Arc<dyn DecodeCheck>) -> Self {
        Self { settings, decoder }
    }

    pub async fn probe(&self, path: &Path) -> ProbeVerdict {
        self.probe_at(path, SystemTime::now()).await
    }

    /// Evaluate the file as seen at `now`
    pub async fn probe_at(&self, path: &Path, now: SystemTime) -> ProbeVerdict {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => return ProbeVerdict::Missing,
        };

        if self.settings.require_marker
            && tokio::fs::metadata(completion_marker_path(path)).await.is_err()
        {
            return ProbeVerdict::MarkerMissing;
        }

        if let Ok(modified) = metadata.modified() {
            // A modification time in the future counts as fresh
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age < self.settings.min_age {
                return ProbeVerdict::TooFresh { age };
            }
        }

        let size = metadata.len();
        if size < self.settings.min_bytes {
            return ProbeVerdict::TooSmall { size };
        }

        match self.decoder.check(path).await {
            Ok(()) => ProbeVerdict::Stable { size },
            Err(reason) => ProbeVerdict::Undecodable(reason),
        }
    }

    /// Poll until the file is stable. A missing file fails at once; a file that never settles
    /// within the bound is reported missing too.
    pub async fn wait_until_stable(&self, path: &Path) -> Result<u64, JobError> {
        let deadline = Instant::now() + self.settings.timeout;
        loop {
            let verdict = self.probe(path).await;
            match verdict {
                ProbeVerdict::Stable { size } => return Ok(size),
                ProbeVerdict::Missing => {
                    return Err(JobError::FileMissing(format!("{:?} does not exist", path)))
                }
                _ => {}
            }

            if Instant::now() + self.settings.poll > deadline {
                return Err(JobError::FileMissing(format!(
                    "{:?} did not become stable within {}s: {}",
                    path,
                    self.settings.timeout.as_secs(),
                    verdict
                )));
            }
            debug!("{:?} not stable yet ({}), polling again", path, verdict);
            tokio::time::sleep(self.settings.poll).await;
        }
    }

    /// One probe, as a job error when the file is not ready
    pub async fn check(&self, path: &Path) -> Result<u64, JobError> {
        match self.probe(path).await {
            ProbeVerdict::Stable { size } => Ok(size),
            ProbeVerdict::Missing => {
                Err(JobError::FileMissing(format!("{:?} does not exist", path)))
            }
            other => Err(JobError::FileNotStable(format!("{:?}: {}", path, other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TS_PACKET: usize = 188;

    struct AlwaysDecodable;

    #[async_trait]
    impl DecodeCheck for AlwaysDecodable {
        async fn check(&self, _path: &Path) -> Result<(), String> {
            Ok(())
        }
    }

    /// Accepts files that start with an MPEG-TS sync byte
    struct SyncByteCheck;

    #[async_trait]
    impl DecodeCheck for SyncByteCheck {
        async fn check(&self, path: &Path) -> Result<(), String> {
            let data = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
            match data.first() {
                Some(0x47) => Ok(()),
                _ => Err("no sync byte".to_string()),
            }
        }
    }

    fn settings(require_marker: bool) -> StabilitySettings {
        StabilitySettings {
            min_age: Duration::from_secs(5),
            min_bytes: 10 * 1024,
            require_marker,
            timeout: Duration::from_millis(200),
            poll: Duration::from_millis(50),
        }
    }

    fn ts_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        for packet in data.chunks_mut(TS_PACKET) {
            packet[0] = 0x47;
        }
        data
    }

    #[tokio::test]
    async fn young_file_is_rejected_until_it_ages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_20240517_141000.ts");
        std::fs::write(&path, ts_bytes(50 * 1024)).unwrap();
        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();

        let probe = StabilityProbe::new(settings(false), Arc::new(SyncByteCheck));
        let verdict = probe.probe_at(&path, modified + Duration::from_secs(2)).await;
        assert!(matches!(verdict, ProbeVerdict::TooFresh { .. }), "{}", verdict);

        let verdict = probe.probe_at(&path, modified + Duration::from_secs(6)).await;
        assert_eq!(verdict, ProbeVerdict::Stable { size: 50 * 1024 });
    }

    #[tokio::test]
    async fn marker_size_and_decodability_are_checked() {
        let dir = tempfile::tempdir().unwrap();
        let later = SystemTime::now() + Duration::from_secs(60);
        let probe = StabilityProbe::new(settings(true), Arc::new(SyncByteCheck));

        let path = dir.path().join("segment_20240517_141000.ts");
        assert_eq!(probe.probe_at(&path, later).await, ProbeVerdict::Missing);

        std::fs::write(&path, vec![0u8; 20 * 1024]).unwrap();
        assert_eq!(probe.probe_at(&path, later).await, ProbeVerdict::MarkerMissing);

        std::fs::write(completion_marker_path(&path), b"{}").unwrap();
        assert!(matches!(
            probe.probe_at(&path, later).await,
            ProbeVerdict::Undecodable(_)
        ));

        std::fs::write(&path, ts_bytes(20 * 1024)).unwrap();
        assert!(probe.probe_at(&path, later).await.is_stable());

        std::fs::write(&path, ts_bytes(1024)).unwrap();
        assert_eq!(
            probe.probe_at(&path, later).await,
            ProbeVerdict::TooSmall { size: 1024 }
        );
    }

    #[tokio::test]
    async fn missing_ffprobe_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_20240517_141000.ts");
        std::fs::write(&path, ts_bytes(4 * TS_PACKET)).unwrap();

        let check = FfprobeCheck::new(Path::new("/nonexistent/ffprobe"), Duration::from_secs(5));
        assert!(check.ensure_available().await.is_err());
        let err = check.check(&path).await.unwrap_err();
        assert!(err.contains("Failed to run"), "{}", err);
    }

    #[tokio::test]
    async fn ffprobe_needs_a_real_video_packet() {
        let check = FfprobeCheck::new(Path::new("ffprobe"), Duration::from_secs(20));
        if check.ensure_available().await.is_err() {
            println!("Skipping ffprobe test. ffprobe is not installed");
            return;
        }
        let dir = tempfile::tempdir().unwrap();

        // Magic bytes alone are not a video
        let fake = dir.path().join("fake.ts");
        std::fs::write(&fake, ts_bytes(64 * TS_PACKET)).unwrap();
        assert!(check.check(&fake).await.is_err());
        let gif = dir.path().join("fake.mp4");
        std::fs::write(&gif, b"GIF89a\0\0\0\0").unwrap();
        assert!(check.check(&gif).await.is_err());

        let real = dir.path().join("real.ts");
        let encoded = tokio::process::Command::new("ffmpeg")
            .args([
                "-v",
                "error",
                "-f",
                "lavfi",
                "-i",
                "testsrc=duration=1:size=64x64:rate=5",
                "-c:v",
                "mpeg2video",
                "-f",
                "mpegts",
                "-y",
            ])
            .arg(&real)
            .status()
            .await;
        if !matches!(encoded, Ok(status) if status.success()) {
            println!("Skipping the decodable half. ffmpeg could not encode a sample");
            return;
        }
        check.check(&real).await.unwrap();
    }

    #[tokio::test]
    async fn waiting_gives_up_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_20240517_141000.ts");
        std::fs::write(&path, ts_bytes(50 * 1024)).unwrap();

        // Never ages past the threshold within the wait bound
        let probe = StabilityProbe::new(settings(false), Arc::new(AlwaysDecodable));
        assert!(matches!(
            probe.wait_until_stable(&path).await,
            Err(JobError::FileMissing(_))
        ));
        assert!(matches!(probe.check(&path).await, Err(JobError::FileNotStable(_))));

        let missing = dir.path().join("gone.ts");
        assert!(matches!(
            probe.wait_until_stable(&missing).await,
            Err(JobError::FileMissing(_))
        ));
    }
}
