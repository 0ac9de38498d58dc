//! Boundary to the external analyzer.
//!
//! The analyzer is opaque: it receives media bytes with a content type and optional hints and
//! answers with a structured safety/development report. Everything downstream only depends on
//! the [`Analyzer`] trait so tests can substitute a fake.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

pub mod http;
pub mod realtime;

pub use http::HttpAnalyzer;
pub use realtime::{DetectorDecision, RealtimeDetector};

/// Failure of one analyzer call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalyzerError {
    /// Worth retrying the same call (overload, 5xx, timeouts, connection resets)
    #[error("transient analyzer failure: {0}")]
    Transient(String),
    /// Retrying the same input cannot succeed
    #[error("permanent analyzer failure: {0}")]
    Permanent(String),
}

impl AnalyzerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, AnalyzerError::Transient(_))
    }
}

/// Optional context forwarded with a request
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_age_months: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub camera_id: String,
    pub content_type: &'static str,
    pub data: Vec<u8>,
    pub hints: AnalysisHints,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// One discrete event found by the analyzer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Incident {
    #[serde(rename = "type")]
    pub kind: String,
    pub severity: Severity,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Position inside the analyzed media, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_secs: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SafetyReport {
    pub score: f64,
    #[serde(default)]
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DevelopmentReport {
    pub score: f64,
    /// Sub-scores keyed by category (motor, social, ...)
    #[serde(default)]
    pub categories: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AnalysisReport {
    pub safety: SafetyReport,
    pub development: DevelopmentReport,
}

impl AnalysisReport {
    pub fn incident_count(&self) -> usize {
        self.safety.incidents.len()
    }
}

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, AnalyzerError>;
}

/// Content type declared for a media file, from its extension
pub fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .as_deref()
    {
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("ts") => "video/mp2t",
        Some("webm") => "video/webm",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}
