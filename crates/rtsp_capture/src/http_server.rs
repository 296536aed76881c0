//! HTTP API for on-demand frame capture
//!
//! `GET /capture/{stream_name}` returns the cached frame of a stream as JPEG.
//! Handlers only read the reader caches, they never touch the network
//! sources.

use crate::frame::FrameError;
use crate::reader::{StreamStats, StreamStatus};
use crate::registry::StreamRegistry;
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

/// Shared state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub jpeg_quality: u8,
}

/// Client-visible capture failures
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Stream not found")]
    StreamNotFound(String),
    #[error("No frame available")]
    NoFrame(String),
    #[error("Failed to encode frame")]
    Encode(String),
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let status = match &self {
            CaptureError::StreamNotFound(_) => StatusCode::NOT_FOUND,
            CaptureError::NoFrame(_) | CaptureError::Encode(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

/// JSON entry for one stream in `GET /streams`
#[derive(Serialize)]
pub struct StreamStateResponse {
    pub name: String,
    pub status: StreamStatus,
    pub has_frame: bool,
    pub last_frame_age_ms: Option<u64>,
    #[serde(flatten)]
    pub stats: StreamStats,
}

/// JSON response for `GET /streams`
#[derive(Serialize)]
pub struct StreamListResponse {
    pub streams: Vec<StreamStateResponse>,
}

/// GET /capture/{stream_name} - Latest frame as JPEG
async fn capture_image(
    State(state): State<AppState>,
    Path(stream_name): Path<String>,
) -> Result<Response, CaptureError> {
    let Some(reader) = state.registry.lookup(&stream_name) else {
        log::warn!("Stream '{}' not found in RTSP streams", stream_name);
        return Err(CaptureError::StreamNotFound(stream_name));
    };

    let Some(frame) = reader.get_frame() else {
        log::error!(
            "Failed to capture frame from '{}'. No frame available",
            stream_name
        );
        return Err(CaptureError::NoFrame(stream_name));
    };

    let quality = state.jpeg_quality;
    let jpeg = tokio::task::spawn_blocking(move || frame.to_jpeg(quality))
        .await
        .map_err(|e| CaptureError::Encode(e.to_string()))?
        .map_err(|e: FrameError| {
            log::error!("Failed to encode frame from '{}': {}", stream_name, e);
            CaptureError::Encode(e.to_string())
        })?;

    log::debug!(
        "Captured frame from '{}' ({} bytes)",
        stream_name,
        jpeg.len()
    );

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg).into_response())
}

/// GET /streams - Capture state of every registered stream
async fn list_streams(State(state): State<AppState>) -> Json<StreamListResponse> {
    let streams = state
        .registry
        .iter()
        .map(|(name, reader)| {
            let frame = reader.get_frame();
            StreamStateResponse {
                name: name.to_string(),
                status: reader.status(),
                has_frame: frame.is_some(),
                last_frame_age_ms: frame.map(|f| f.age().as_millis() as u64),
                stats: reader.stats(),
            }
        })
        .collect();

    Json(StreamListResponse { streams })
}

/// GET /health - Health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// Create the HTTP router
pub fn create_router(registry: Arc<StreamRegistry>, jpeg_quality: u8) -> Router {
    let state = AppState {
        registry,
        jpeg_quality,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/streams", get(list_streams))
        .route("/capture/{stream_name}", get(capture_image))
        .layer(cors)
        .with_state(state)
}

/// Serve `router` on `bind_addr` until the shutdown signal fires
pub async fn run_http_server(
    router: Router,
    bind_addr: &str,
    mut shutdown_rx: watch::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    log::info!("HTTP server listening on http://{}", bind_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown_rx.changed().await.ok();
        })
        .await?;

    log::info!("HTTP server stopped");
    Ok(())
}
