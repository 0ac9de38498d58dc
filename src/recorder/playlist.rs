//! Rolling live playlist.
//!
//! Only the newest `window` chunks are advertised and there is no end tag, so players joining
//! at any point start at the live edge instead of the first chunk ever produced.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write;
use std::path::Path;

/// A chunk announced by the live encoder
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkListEntry {
    pub file_name: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

impl ChunkListEntry {
    pub fn duration(&self) -> f64 {
        (self.end_secs - self.start_secs).max(0.0)
    }
}

/// Parse one `file,start,end` line of the encoder's chunk list
pub fn parse_chunk_list_line(line: &str) -> Option<ChunkListEntry> {
    let mut fields = line.trim().rsplitn(3, ',');
    let end_secs = fields.next()?.trim().parse().ok()?;
    let start_secs = fields.next()?.trim().parse().ok()?;
    let file = fields.next()?.trim().trim_matches('"');
    let file_name = Path::new(file).file_name()?.to_str()?.to_string();
    Some(ChunkListEntry {
        file_name,
        start_secs,
        end_secs,
    })
}

/// `<camera_id>_<seq>.ts`
pub fn chunk_file_name(camera_id: &str, sequence: u64) -> String {
    format!("{}_{}.ts", camera_id, sequence)
}

pub fn parse_chunk_sequence(camera_id: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(camera_id)?
        .strip_prefix('_')?
        .strip_suffix(".ts")?
        .parse()
        .ok()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaylistEntry {
    pub sequence: u64,
    pub uri: String,
    pub duration: f64,
    /// Encoder restarted before this chunk
    pub discontinuity: bool,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LivePlaylist {
    window: usize,
    target_duration: u32,
    entries: VecDeque<PlaylistEntry>,
    discontinuity_sequence: u64,
    pending_discontinuity: bool,
}

impl LivePlaylist {
    pub fn new(window: usize, target_duration: u32) -> Self {
        Self {
            window: window.max(1),
            target_duration: target_duration.max(1),
            entries: VecDeque::with_capacity(window.max(1) + 1),
            discontinuity_sequence: 0,
            pending_discontinuity: false,
        }
    }

    /// The next chunk follows an encoder restart
    pub fn mark_discontinuity(&mut self) {
        if !self.entries.is_empty() {
            self.pending_discontinuity = true;
        }
    }

    /// Append a chunk and return the entries that fell out of the window
    pub fn push(
        &mut self,
        sequence: u64,
        uri: String,
        duration: f64,
        added_at: DateTime<Utc>,
    ) -> Vec<PlaylistEntry> {
        self.entries.push_back(PlaylistEntry {
            sequence,
            uri,
            duration,
            discontinuity: std::mem::take(&mut self.pending_discontinuity),
            added_at,
        });

        let mut pruned = Vec::new();
        while self.entries.len() > self.window {
            if let Some(old) = self.entries.pop_front() {
                if old.discontinuity {
                    self.discontinuity_sequence += 1;
                }
                pruned.push(old);
            }
        }
        pruned
    }

    pub fn entries(&self) -> impl Iterator<Item = &PlaylistEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn media_sequence(&self) -> u64 {
        self.entries.front().map_or(0, |entry| entry.sequence)
    }

    /// Newest advertised chunk
    pub fn live_edge(&self) -> Option<&PlaylistEntry> {
        self.entries.back()
    }

    pub fn contains_uri(&self, uri: &str) -> bool {
        self.entries.iter().any(|entry| entry.uri == uri)
    }

    pub fn render(&self) -> String {
        let longest = self
            .entries
            .iter()
            .map(|entry| entry.duration.ceil() as u32)
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        let _ = writeln!(out, "#EXTM3U");
        let _ = writeln!(out, "#EXT-X-VERSION:3");
        let _ = writeln!(
            out,
            "#EXT-X-TARGETDURATION:{}",
            longest.max(self.target_duration)
        );
        let _ = writeln!(out, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence());
        if self.discontinuity_sequence > 0 {
            let _ = writeln!(
                out,
                "#EXT-X-DISCONTINUITY-SEQUENCE:{}",
                self.discontinuity_sequence
            );
        }
        for entry in &self.entries {
            if entry.discontinuity {
                let _ = writeln!(out, "#EXT-X-DISCONTINUITY");
            }
            let _ = writeln!(out, "#EXTINF:{:.3},", entry.duration);
            let _ = writeln!(out, "{}", entry.uri);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_encoder_chunk_lines() {
        let entry = parse_chunk_list_line("/live/cam1/cam1_12.ts,24.000000,26.000000\n").unwrap();
        assert_eq!(entry.file_name, "cam1_12.ts");
        assert_eq!(entry.duration(), 2.0);
        assert_eq!(parse_chunk_sequence("cam1", &entry.file_name), Some(12));

        assert!(parse_chunk_list_line("garbage").is_none());
        assert!(parse_chunk_list_line("cam1_1.ts,abc,2.0").is_none());
        assert_eq!(parse_chunk_sequence("cam1", "cam10_3.ts"), None);
    }

    #[test]
    fn late_viewer_only_sees_the_recent_window() {
        let started = DateTime::<Utc>::from_timestamp(1_715_954_400, 0).unwrap();
        let mut playlist = LivePlaylist::new(10, 2);

        // 25 minutes of 2 second chunks
        let total = 25 * 60 / 2;
        let mut pruned = 0;
        for seq in 0..total {
            let at = started + chrono::Duration::seconds(seq as i64 * 2);
            pruned += playlist
                .push(seq, chunk_file_name("cam1", seq), 2.0, at)
                .len();
        }
        let now = started + chrono::Duration::minutes(25);

        assert_eq!(playlist.len(), 10);
        assert_eq!(pruned as u64, total - 10);
        assert_eq!(playlist.media_sequence(), total - 10);
        for entry in playlist.entries() {
            assert!(now - entry.added_at <= chrono::Duration::seconds(20));
        }

        let manifest = playlist.render();
        assert!(manifest.contains(&format!("#EXT-X-MEDIA-SEQUENCE:{}", total - 10)));
        assert!(!manifest.contains("cam1_0.ts"));
        assert!(manifest.contains(&chunk_file_name("cam1", total - 1)));
        assert!(!manifest.contains("#EXT-X-ENDLIST"));
    }

    #[test]
    fn discontinuity_is_tagged_and_counted_once_pruned() {
        let now = Utc::now();
        let mut playlist = LivePlaylist::new(2, 2);
        playlist.mark_discontinuity(); // nothing advertised yet, ignored
        playlist.push(0, "c_0.ts".into(), 2.0, now);
        playlist.mark_discontinuity();
        playlist.push(1, "c_1.ts".into(), 2.0, now);

        let manifest = playlist.render();
        assert_eq!(manifest.matches("#EXT-X-DISCONTINUITY\n").count(), 1);
        assert!(!manifest.contains("DISCONTINUITY-SEQUENCE"));

        playlist.push(2, "c_2.ts".into(), 2.0, now);
        playlist.push(3, "c_3.ts".into(), 2.0, now);
        let manifest = playlist.render();
        assert!(manifest.contains("#EXT-X-DISCONTINUITY-SEQUENCE:1"));
        assert!(!manifest.contains("#EXT-X-DISCONTINUITY\n"));
    }

    #[test]
    fn target_duration_covers_the_longest_chunk() {
        let mut playlist = LivePlaylist::new(5, 2);
        playlist.push(0, "c_0.ts".into(), 3.2, Utc::now());
        assert!(playlist.render().contains("#EXT-X-TARGETDURATION:4"));
    }
}
