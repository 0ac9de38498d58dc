use crate::analysis::{AnalysisReport, AnalysisRequest, Analyzer, AnalyzerError};
use crate::error::Error;
use async_trait::async_trait;
use log::debug;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use url::Url;

/// Analyzer reached over HTTP: the media is POSTed as the request body and the report comes
/// back as JSON
pub struct HttpAnalyzer {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl HttpAnalyzer {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Analyzer(format!("Invalid analyzer URL {}: {}", endpoint, e)))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Analyzer(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl Analyzer for HttpAnalyzer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport, AnalyzerError> {
        let size = request.data.len();
        let mut builder = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, request.content_type)
            .header("X-Camera-Id", &request.camera_id);
        if let Some(key) = &self.api_key {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", key));
        }
        if let Some(stage) = &request.hints.stage {
            builder = builder.header("X-Analysis-Stage", stage);
        }
        if let Some(age) = request.hints.subject_age_months {
            builder = builder.header("X-Subject-Age-Months", age.to_string());
        }

        let response = builder
            .body(request.data)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if let Some(err) = classify_status(status) {
            let body = response.text().await.unwrap_or_default();
            return Err(match err {
                AnalyzerError::Transient(msg) => AnalyzerError::Transient(format!("{}: {}", msg, body)),
                AnalyzerError::Permanent(msg) => AnalyzerError::Permanent(format!("{}: {}", msg, body)),
            });
        }

        let report = response
            .json::<AnalysisReport>()
            .await
            .map_err(classify_transport)?;
        debug!(
            "Analyzer answered for {} ({} bytes): {} incidents",
            request.camera_id,
            size,
            report.incident_count()
        );
        Ok(report)
    }
}

/// Error for a non-success status, `None` on success
fn classify_status(status: StatusCode) -> Option<AnalyzerError> {
    if status.is_success() {
        return None;
    }
    let message = format!("analyzer returned {}", status);
    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    Some(if transient {
        AnalyzerError::Transient(message)
    } else {
        AnalyzerError::Permanent(message)
    })
}

fn classify_transport(e: reqwest::Error) -> AnalyzerError {
    if e.is_decode() {
        AnalyzerError::Permanent(format!("invalid analyzer response: {}", e))
    } else if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        AnalyzerError::Transient(e.to_string())
    } else {
        AnalyzerError::Permanent(e.to_string())
    }
}
