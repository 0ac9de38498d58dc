pub mod hls_controller;

use crate::config::ApiConfig;
use crate::error::Error;
use crate::stream_manager::StreamManager;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use log::info;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub streams: Arc<StreamManager>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

/// Read-only HTTP surface: live playlists, live chunks and the stream registry
pub struct LiveApi {
    config: ApiConfig,
    streams: Arc<StreamManager>,
}

impl LiveApi {
    pub fn new(config: &ApiConfig, streams: Arc<StreamManager>) -> Self {
        Self {
            config: config.clone(),
            streams,
        }
    }

    pub fn router(&self) -> Router {
        router(AppState {
            streams: Arc::clone(&self.streams),
        })
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let app = self.router();

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;
        info!("Live API listening on {}", addr);

        axum::Server::bind(&addr)
            .serve(app.into_make_service())
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;

        info!("Live API stopped");
        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/live/:camera_id/:file", get(hls_controller::live_file))
        .route("/streams", get(hls_controller::list_streams))
        .route("/streams/:camera_id", get(hls_controller::stream_status))
        .with_state(state)
}
