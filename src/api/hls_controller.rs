use crate::api::{ApiResult, AppState};
use crate::error::Error;
use crate::recorder::playlist::parse_chunk_sequence;
use crate::stream_manager::StreamStatus;
use axum::body::StreamBody;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use log::{debug, warn};
use tokio_util::io::ReaderStream;

/// What a `/live/:camera_id/:file` request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveRequest {
    /// `<camera_id>.m3u8`
    Manifest,
    /// `<camera_id>_<seq>.ts`
    Chunk(String),
    Invalid,
}

/// Classify the requested file name. Anything that is not the camera's playlist or one of its
/// chunk names is rejected, which also keeps requests inside the live directory.
pub fn resolve_live_request(camera_id: &str, file: &str) -> LiveRequest {
    if file.strip_suffix(".m3u8") == Some(camera_id) {
        return LiveRequest::Manifest;
    }
    match parse_chunk_sequence(camera_id, file) {
        Some(_) => LiveRequest::Chunk(file.to_string()),
        None => LiveRequest::Invalid,
    }
}

fn headers(content_type: &'static str, cache_control: &'static str) -> HeaderMap {
    HeaderMap::from_iter([
        (header::CONTENT_TYPE, HeaderValue::from_static(content_type)),
        (header::CACHE_CONTROL, HeaderValue::from_static(cache_control)),
        (header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*")),
    ])
}

pub async fn live_file(
    State(state): State<AppState>,
    Path((camera_id, file)): Path<(String, String)>,
) -> Response {
    match resolve_live_request(&camera_id, &file) {
        LiveRequest::Manifest => match state.streams.live_manifest(&camera_id).await {
            Some(manifest) => (
                StatusCode::OK,
                headers("application/vnd.apple.mpegurl", "no-cache"),
                manifest,
            )
                .into_response(),
            None => (StatusCode::NOT_FOUND, "No live stream").into_response(),
        },
        LiveRequest::Chunk(file) => {
            // Only chunks the manifest still advertises are served
            let Some(path) = state.streams.live_chunk_path(&camera_id, &file).await else {
                debug!("Chunk {} of {} is not advertised", file, camera_id);
                return (StatusCode::NOT_FOUND, "Chunk not available").into_response();
            };
            match tokio::fs::File::open(&path).await {
                Ok(handle) => {
                    let body = StreamBody::new(ReaderStream::new(handle));
                    (StatusCode::OK, headers("video/mp2t", "max-age=60"), body).into_response()
                }
                Err(e) => {
                    warn!("Advertised chunk {:?} cannot be opened: {}", path, e);
                    (StatusCode::NOT_FOUND, "Chunk not available").into_response()
                }
            }
        }
        LiveRequest::Invalid => (StatusCode::BAD_REQUEST, "Invalid live file").into_response(),
    }
}

pub async fn list_streams(State(state): State<AppState>) -> Json<Vec<StreamStatus>> {
    Json(state.streams.list().await)
}

pub async fn stream_status(
    State(state): State<AppState>,
    Path(camera_id): Path<String>,
) -> ApiResult<Json<StreamStatus>> {
    let status = state
        .streams
        .status(&camera_id)
        .await
        .ok_or_else(|| Error::NotFound(format!("Camera {} is not streaming", camera_id)))?;
    Ok(Json(status))
}
