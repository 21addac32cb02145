use crate::{
    archive::SourceInfo,
    capture::CaptureError,
    cv_utils::{preview_webp, CvUtilsError},
    server::SharedState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::instrument;

const WEBP_CONTENT_TYPE: &str = "image/webp";

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("No {0} configured")]
    NotConfigured(&'static str),
    #[error("Frame not found")]
    NotFound,
    #[error("Error reading frame: {0}")]
    Capture(CaptureError),
    #[error("Error encoding frame: {0}")]
    Encode(#[from] CvUtilsError),
    #[error("Frame task failed: {0}")]
    Task(String),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

impl From<CaptureError> for FrameError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::FrameOutOfRange { .. } => FrameError::NotFound,
            other => FrameError::Capture(other),
        }
    }
}

impl IntoResponse for FrameError {
    fn into_response(self) -> Response {
        let status = match self {
            FrameError::NotConfigured(_) | FrameError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        (status, self.to_string()).into_response()
    }
}

/// Seeks the shared capture to `index` and returns a quarter-size WebP still.
#[instrument(skip(state))]
pub async fn get_frame(
    State(state): State<SharedState>,
    Path(index): Path<i64>,
) -> Result<Response, FrameError> {
    state.metrics.record_request("/video/frame");
    let capture = state
        .capture
        .as_ref()
        .ok_or(FrameError::NotConfigured("capture video"))?;

    let frame = capture.frame_at(index).await?;
    let quality = state.encoding_quality;
    let encoded = tokio::task::spawn_blocking(move || preview_webp(frame, quality))
        .await
        .map_err(|e| FrameError::Task(e.to_string()))??;

    Response::builder()
        .header(header::CONTENT_TYPE, WEBP_CONTENT_TYPE)
        .body(Body::from(encoded))
        .map_err(|e| FrameError::HttpBuilder(e.to_string()))
}

#[instrument(skip(state))]
pub async fn get_archived_frames(
    State(state): State<SharedState>,
    Path(index): Path<i64>,
) -> Result<Json<BTreeMap<String, String>>, FrameError> {
    state.metrics.record_request("/video/frames");
    let archive = state
        .archive
        .as_ref()
        .ok_or(FrameError::NotConfigured("frame archive"))?;
    Ok(Json(archive.frames_at(index)))
}

#[instrument(skip(state))]
pub async fn video_info(
    State(state): State<SharedState>,
) -> Result<Json<BTreeMap<String, SourceInfo>>, FrameError> {
    state.metrics.record_request("/video-info");
    let archive = state
        .archive
        .as_ref()
        .ok_or(FrameError::NotConfigured("frame archive"))?;
    Ok(Json(archive.info()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_maps_to_not_found() {
        let err = FrameError::from(CaptureError::FrameOutOfRange { index: -1, total: 10 });
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_empty_read_maps_to_server_error() {
        let err = FrameError::from(CaptureError::EmptyFrame(3));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
