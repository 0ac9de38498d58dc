//! Wall-clock rotation math, segment file naming and completion markers.
//!
//! Boundaries are computed from the Unix epoch in UTC, so the same `now` always maps to the
//! same segment no matter when the stream process started.

use crate::config::VideoProfile;
use crate::error::Error;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const NAME_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";
const MARKER_EXTENSION: &str = "done";

static SEGMENT_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<kind>segment|archive)_(?P<ts>\d{8}_\d{6})(?:-r(?P<restart>\d+))?\.(?P<ext>[A-Za-z0-9]+)$",
    )
    .expect("segment name pattern is valid")
});

/// Fixed rotation period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPeriod {
    secs: i64,
}

impl RotationPeriod {
    pub fn from_secs(secs: u64) -> Result<Self, Error> {
        if secs == 0 || secs > i64::MAX as u64 {
            return Err(Error::Config(format!("invalid rotation period {}s", secs)));
        }
        Ok(Self { secs: secs as i64 })
    }

    pub fn as_secs(&self) -> i64 {
        self.secs
    }

    pub fn as_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.secs)
    }

    /// Start of the period containing `now`
    pub fn floor(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let into_period = now.timestamp().rem_euclid(self.secs);
        now - chrono::Duration::seconds(into_period)
            - chrono::Duration::nanoseconds(now.timestamp_subsec_nanos() as i64)
    }

    /// First boundary strictly after `now`
    pub fn next_boundary(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(now) + self.as_duration()
    }

    /// Start of the most recently completed period
    pub fn previous_segment_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(now) - self.as_duration()
    }

    /// Time left until the next boundary, never negative
    pub fn until_next_boundary(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.next_boundary(now) - now)
            .to_std()
            .unwrap_or_default()
    }
}

/// Kind of rotating file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    /// Files handed to the analysis queue
    Segment,
    /// Lower-frequency copy kept on its own period
    Archive,
}

impl SegmentKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            SegmentKind::Segment => "segment",
            SegmentKind::Archive => "archive",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "segment" => Some(SegmentKind::Segment),
            "archive" => Some(SegmentKind::Archive),
            _ => None,
        }
    }
}

/// A segment file on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub camera_id: String,
    pub kind: SegmentKind,
    pub start: DateTime<Utc>,
    /// Nominal duration in seconds
    pub duration_secs: i64,
    pub profile: VideoProfile,
    pub path: PathBuf,
}

impl SegmentInfo {
    pub fn nominal_end(&self) -> DateTime<Utc> {
        self.start + chrono::Duration::seconds(self.duration_secs)
    }
}

/// Contents of a completion marker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMarker {
    pub segment: SegmentInfo,
    pub frames: u64,
    pub closed_at: DateTime<Utc>,
}

/// `segment_20240101_140000.mp4`
pub fn segment_file_name(kind: SegmentKind, start: DateTime<Utc>, extension: &str) -> String {
    format!("{}_{}.{}", kind.prefix(), start.format(NAME_TIME_FORMAT), extension)
}

/// Name used when a closed file already occupies the canonical name
pub fn restart_file_name(
    kind: SegmentKind,
    start: DateTime<Utc>,
    extension: &str,
    restart: u32,
) -> String {
    format!(
        "{}_{}-r{}.{}",
        kind.prefix(),
        start.format(NAME_TIME_FORMAT),
        restart,
        extension
    )
}

/// Parsed file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSegmentName {
    pub kind: SegmentKind,
    pub start: DateTime<Utc>,
    pub restart: Option<u32>,
    pub extension: String,
}

pub fn parse_segment_file_name(name: &str) -> Option<ParsedSegmentName> {
    let caps = SEGMENT_NAME.captures(name)?;
    let kind = SegmentKind::from_prefix(caps.name("kind")?.as_str())?;
    let naive = NaiveDateTime::parse_from_str(caps.name("ts")?.as_str(), NAME_TIME_FORMAT).ok()?;
    let restart = match caps.name("restart") {
        Some(m) => Some(m.as_str().parse().ok()?),
        None => None,
    };
    Some(ParsedSegmentName {
        kind,
        start: Utc.from_utc_datetime(&naive),
        restart,
        extension: caps.name("ext")?.as_str().to_string(),
    })
}

/// `segment_20240101_140000.mp4.done`
pub fn completion_marker_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(MARKER_EXTENSION);
    PathBuf::from(name)
}

pub fn is_marked_complete(path: &Path) -> bool {
    completion_marker_path(path).is_file()
}

/// Write the marker through a temporary file and a rename so readers never see it half-written
pub async fn write_completion_marker(marker: &CompletionMarker) -> Result<PathBuf, Error> {
    let final_path = completion_marker_path(&marker.segment.path);
    let mut tmp_name = final_path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let body = serde_json::to_vec_pretty(marker)
        .map_err(|e| Error::Serialization(format!("Failed to encode completion marker: {}", e)))?;
    tokio::fs::write(&tmp_path, body)
        .await
        .map_err(|e| Error::Io(format!("Failed to write marker {:?}: {}", tmp_path, e)))?;
    tokio::fs::rename(&tmp_path, &final_path)
        .await
        .map_err(|e| Error::Io(format!("Failed to publish marker {:?}: {}", final_path, e)))?;

    Ok(final_path)
}

pub async fn read_completion_marker(path: &Path) -> Result<Option<CompletionMarker>, Error> {
    let marker_path = completion_marker_path(path);
    match tokio::fs::read(&marker_path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Serialization(format!("Corrupt marker {:?}: {}", marker_path, e))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(format!("Failed to read marker {:?}: {}", marker_path, e))),
    }
}

/// When the footage of a file begins. Canonical files start on their boundary; restart files
/// start mid-period, which only their marker records.
pub async fn recorded_start(
    path: &Path,
    parsed: &ParsedSegmentName,
) -> Result<Option<DateTime<Utc>>, Error> {
    if parsed.restart.is_none() {
        return Ok(Some(parsed.start));
    }
    Ok(read_completion_marker(path)
        .await?
        .map(|marker| marker.segment.start))
}

/// Remove a segment file together with its marker; missing files are not an error
pub async fn remove_segment_files(path: &Path) -> Result<(), Error> {
    for target in [path.to_path_buf(), completion_marker_path(path)] {
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(format!("Failed to remove {:?}: {}", target, e))),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 17, h, m, s).unwrap()
    }

    #[test]
    fn first_rotation_is_on_the_wall_clock_boundary() {
        let period = RotationPeriod::from_secs(600).unwrap();
        let started = at(14, 3, 0);

        assert_eq!(period.floor(started), at(14, 0, 0));
        assert_eq!(period.next_boundary(started), at(14, 10, 0));
        assert_ne!(period.next_boundary(started), at(14, 13, 0));
    }

    #[test]
    fn previous_segment_start_ignores_process_start() {
        let period = RotationPeriod::from_secs(600).unwrap();
        for now in [at(14, 10, 30), at(14, 15, 0), at(14, 19, 59)] {
            assert_eq!(period.previous_segment_start(now), at(14, 0, 0));
        }
        assert_eq!(period.previous_segment_start(at(14, 20, 0)), at(14, 10, 0));
    }

    #[test]
    fn floor_drops_sub_second_precision() {
        let period = RotationPeriod::from_secs(600).unwrap();
        let now = at(9, 59, 59) + chrono::Duration::milliseconds(750);
        assert_eq!(period.floor(now), at(9, 50, 0));
        assert_eq!(
            period.until_next_boundary(now),
            std::time::Duration::from_millis(250)
        );
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(RotationPeriod::from_secs(0).is_err());
    }

    #[test]
    fn names_round_trip_through_the_parser() {
        let name = segment_file_name(SegmentKind::Segment, at(14, 0, 0), "mp4");
        assert_eq!(name, "segment_20240517_140000.mp4");

        let parsed = parse_segment_file_name(&name).unwrap();
        assert_eq!(parsed.kind, SegmentKind::Segment);
        assert_eq!(parsed.start, at(14, 0, 0));
        assert_eq!(parsed.restart, None);

        let restarted = restart_file_name(SegmentKind::Archive, at(14, 30, 0), "mkv", 2);
        let parsed = parse_segment_file_name(&restarted).unwrap();
        assert_eq!(parsed.kind, SegmentKind::Archive);
        assert_eq!(parsed.restart, Some(2));
        assert_eq!(parsed.extension, "mkv");

        assert!(parse_segment_file_name("segment_20240517_140000.mp4.done").is_none());
        assert!(parse_segment_file_name("clip_20240517_140000.mp4").is_none());
    }

    #[tokio::test]
    async fn marker_is_written_next_to_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("segment_20240517_140000.mp4");
        tokio::fs::write(&path, b"data").await.unwrap();
        assert!(!is_marked_complete(&path));

        let marker = CompletionMarker {
            segment: SegmentInfo {
                camera_id: "cam1".into(),
                kind: SegmentKind::Segment,
                start: at(14, 0, 0),
                duration_secs: 600,
                profile: VideoProfile::new(640, 360, 5),
                path: path.clone(),
            },
            frames: 3000,
            closed_at: at(14, 10, 1),
        };
        write_completion_marker(&marker).await.unwrap();

        assert!(is_marked_complete(&path));
        let read = read_completion_marker(&path).await.unwrap().unwrap();
        assert_eq!(read.frames, 3000);

        remove_segment_files(&path).await.unwrap();
        assert!(!path.exists());
        assert!(!is_marked_complete(&path));
    }
}
