use crate::analysis::{AnalysisHints, AnalysisReport, AnalysisRequest, Analyzer};
use crate::db::models::RealtimeEvent;
use crate::db::repositories::EventSink;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use log::{debug, info, warn};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// What [`RealtimeDetector::on_frame`] did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorDecision {
    NotDue,
    Dispatched,
    /// Due, but the previous call is still running
    Skipped,
}

/// Clears the in-flight flag when the detached call ends, however it ends
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Inline near-realtime detection on the live track.
///
/// Every `every_frames` frames one snapshot is sent to the analyzer from a detached task.
/// At most one call is in flight; a due frame arriving while one runs is dropped, never
/// queued.
pub struct RealtimeDetector {
    camera_id: String,
    analyzer: Arc<dyn Analyzer>,
    events: Arc<dyn EventSink>,
    hints: AnalysisHints,
    every_frames: u64,
    jpeg_quality: u8,
    frames_seen: u64,
    in_flight: Arc<AtomicBool>,
    skipped: Arc<AtomicU64>,
}

impl RealtimeDetector {
    pub fn new(
        camera_id: &str,
        analyzer: Arc<dyn Analyzer>,
        events: Arc<dyn EventSink>,
        hints: AnalysisHints,
        every_frames: u64,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            analyzer,
            events,
            hints,
            every_frames: every_frames.max(1),
            jpeg_quality: jpeg_quality.clamp(1, 100),
            frames_seen: 0,
            in_flight: Arc::new(AtomicBool::new(false)),
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Count a live frame and dispatch an analysis when due. Never waits on the analyzer.
    pub fn on_frame(&mut self, image: Arc<RgbImage>, captured_at: DateTime<Utc>) -> DetectorDecision {
        self.frames_seen += 1;
        if self.frames_seen % self.every_frames != 0 {
            return DetectorDecision::NotDue;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            debug!("Realtime analysis for {} still running, skipping", self.camera_id);
            return DetectorDecision::Skipped;
        }

        let guard = InFlight(self.in_flight.clone());
        let camera_id = self.camera_id.clone();
        let analyzer = self.analyzer.clone();
        let events = self.events.clone();
        let hints = self.hints.clone();
        let quality = self.jpeg_quality;

        tokio::spawn(async move {
            let _guard = guard;

            let jpeg = match tokio::task::spawn_blocking(move || encode_jpeg(&image, quality)).await {
                Ok(Ok(jpeg)) => jpeg,
                Ok(Err(e)) => {
                    warn!("Failed to encode snapshot for {}: {}", camera_id, e);
                    return;
                }
                Err(e) => {
                    warn!("Snapshot encoder task for {} failed: {}", camera_id, e);
                    return;
                }
            };

            let request = AnalysisRequest {
                camera_id: camera_id.clone(),
                content_type: "image/jpeg",
                data: jpeg,
                hints,
            };
            // A failed detection is dropped, the next due frame tries again
            let report = match analyzer.analyze(request).await {
                Ok(report) => report,
                Err(e) => {
                    warn!("Realtime analysis for {} failed: {}", camera_id, e);
                    return;
                }
            };

            for event in events_from_report(&camera_id, captured_at, &report) {
                match events.record(&event).await {
                    Ok(()) => info!(
                        "Realtime {} event for {}: {}",
                        event.severity, camera_id, event.title
                    ),
                    Err(e) => warn!("Failed to store realtime event for {}: {}", camera_id, e),
                }
            }
        });

        DetectorDecision::Dispatched
    }
}

fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}

/// One event per reported incident
pub fn events_from_report(
    camera_id: &str,
    captured_at: DateTime<Utc>,
    report: &AnalysisReport,
) -> Vec<RealtimeEvent> {
    let created_at = Utc::now();
    report
        .safety
        .incidents
        .iter()
        .map(|incident| RealtimeEvent {
            id: Uuid::new_v4(),
            camera_id: camera_id.to_string(),
            timestamp: captured_at,
            event_type: incident.kind.clone(),
            severity: incident.severity.to_string(),
            title: incident.title.clone(),
            description: incident.description.clone(),
            metadata: Some(json!({
                "safety_score": report.safety.score,
                "offset_secs": incident.offset_secs,
            })),
            created_at,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{AnalyzerError, Incident, Severity};
    use crate::db::repositories::MemoryEventSink;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Blocks every call until the test releases a permit
    struct GatedAnalyzer {
        gate: Semaphore,
        calls: AtomicU64,
        content_types: std::sync::Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl Analyzer for GatedAnalyzer {
        async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, AnalyzerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.content_types.lock().unwrap().push(request.content_type);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| AnalyzerError::Permanent(e.to_string()))?;
            permit.forget();

            let mut report = AnalysisReport::default();
            report.safety.incidents.push(Incident {
                kind: "climbing".into(),
                severity: Severity::High,
                title: "Climbing the crib rail".into(),
                description: String::new(),
                offset_secs: None,
            });
            Ok(report)
        }
    }

    async fn wait_idle(detector: &RealtimeDetector) {
        for _ in 0..200 {
            if !detector.is_busy() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("detector stayed busy");
    }

    #[tokio::test]
    async fn one_call_in_flight_and_due_frames_are_dropped() {
        let analyzer = Arc::new(GatedAnalyzer {
            gate: Semaphore::new(0),
            calls: AtomicU64::new(0),
            content_types: std::sync::Mutex::new(Vec::new()),
        });
        let sink = Arc::new(MemoryEventSink::new());
        let mut detector = RealtimeDetector::new(
            "cam1",
            analyzer.clone(),
            sink.clone(),
            AnalysisHints::default(),
            3,
            80,
        );
        let frame = Arc::new(RgbImage::new(8, 8));
        let now = Utc::now();

        let decisions: Vec<_> = (0..9)
            .map(|_| detector.on_frame(frame.clone(), now))
            .collect();
        use DetectorDecision::*;
        assert_eq!(
            decisions,
            vec![NotDue, NotDue, Dispatched, NotDue, NotDue, Skipped, NotDue, NotDue, Skipped]
        );
        assert_eq!(detector.skipped(), 2);

        analyzer.gate.add_permits(1);
        wait_idle(&detector).await;

        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.content_types.lock().unwrap()[0], "image/jpeg");
        let events = sink.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].severity, "high");
        assert_eq!(events[0].timestamp, now);

        // Free again, so the next due frame is dispatched
        for _ in 0..2 {
            assert_eq!(detector.on_frame(frame.clone(), now), NotDue);
        }
        assert_eq!(detector.on_frame(frame.clone(), now), Dispatched);
        analyzer.gate.add_permits(1);
        wait_idle(&detector).await;
    }
}
