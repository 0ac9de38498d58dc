use crate::worker::stability::DecodeCheck;
use async_trait::async_trait;
use gstreamer as gst;
use gstreamer_pbutils::{Discoverer, DiscovererResult};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Decodability check through the GStreamer discoverer: the file must demux and expose at
/// least one video stream
pub struct GstDiscovererCheck {
    timeout: Duration,
}

impl GstDiscovererCheck {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        gst::init()?;
        Ok(Self { timeout })
    }
}

#[async_trait]
impl DecodeCheck for GstDiscovererCheck {
    async fn check(&self, path: &Path) -> Result<(), String> {
        let absolute = std::fs::canonicalize(path).map_err(|e| e.to_string())?;
        let uri = Url::from_file_path(&absolute)
            .map_err(|_| format!("{:?} has no file URI", absolute))?;
        let timeout = gst::ClockTime::from_seconds(self.timeout.as_secs().max(1));

        tokio::task::spawn_blocking(move || {
            let discoverer = Discoverer::new(timeout).map_err(|e| e.to_string())?;
            let info = discoverer
                .discover_uri(uri.as_str())
                .map_err(|e| e.to_string())?;
            if info.result() != DiscovererResult::Ok {
                return Err(format!("discoverer result {:?}", info.result()));
            }
            if info.video_streams().is_empty() {
                return Err("no video stream".to_string());
            }
            Ok(())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}
