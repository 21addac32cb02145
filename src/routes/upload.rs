use crate::{
    frame_store::{BatchOutcome, FrameBatch, SessionError},
    reconstruct::spawn_reconstruction,
    server::SharedState,
};
use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::str::FromStr;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Invalid value for {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Upload task failed: {0}")]
    Task(String),
    #[error("Session {0} not found")]
    UnknownSession(String),
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = match &self {
            UploadError::Session(
                SessionError::SessionInProgress { .. }
                | SessionError::SessionClosed(_)
                | SessionError::SessionMismatch { .. }
                | SessionError::ReconstructionInProgress(_),
            ) => StatusCode::CONFLICT,
            UploadError::Session(_) => StatusCode::BAD_REQUEST,
            UploadError::InvalidField { .. } => StatusCode::BAD_REQUEST,
            UploadError::Multipart(_) => StatusCode::BAD_REQUEST,
            UploadError::UnknownSession(_) => StatusCode::NOT_FOUND,
            UploadError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Error in upload_frames: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Serialize)]
pub struct UploadResponse {
    status: &'static str,
    message: String,
    session_id: String,
}

fn parse_field<T: FromStr>(field: &'static str, value: String) -> Result<T, UploadError> {
    value
        .trim()
        .parse()
        .map_err(|_| UploadError::InvalidField { field, value })
}

/// Collects one batch from the multipart form.
///
/// Numeric fields that are absent read as zero; unknown fields are ignored.
async fn read_batch(multipart: &mut Multipart) -> Result<FrameBatch, UploadError> {
    let mut batch = FrameBatch::default();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "files" => batch.files.push(field.bytes().await?),
            "width" => batch.width = parse_field("width", field.text().await?)?,
            "height" => batch.height = parse_field("height", field.text().await?)?,
            "batchIndex" => batch.batch_index = parse_field("batchIndex", field.text().await?)?,
            "totalFrames" => {
                batch.total_frames = parse_field("totalFrames", field.text().await?)?
            }
            "batchSize" => {
                batch.batch_size = Some(parse_field("batchSize", field.text().await?)?)
            }
            "sessionId" => {
                let id = field.text().await?;
                if !id.trim().is_empty() {
                    batch.session_id = Some(id.trim().to_string());
                }
            }
            _ => {}
        }
    }

    Ok(batch)
}

#[instrument(skip(state, multipart))]
pub async fn upload_frames(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Response, UploadError> {
    state.metrics.record_request("/upload-frames");

    let batch = read_batch(&mut multipart).await?;
    let batch_index = batch.batch_index;
    let file_count = batch.files.len();
    tracing::info!(
        "Received batch {} with {} files. Total frames: {}",
        batch_index,
        file_count,
        batch.total_frames
    );

    let store = state.frame_store.clone();
    let outcome = tokio::task::spawn_blocking(move || store.ingest(batch))
        .await
        .map_err(|e| UploadError::Task(e.to_string()))??;
    state.metrics.record_frames_uploaded(file_count as u64);

    let response = match outcome {
        BatchOutcome::Accepted { session_id, .. } => (
            StatusCode::OK,
            Json(UploadResponse {
                status: "success",
                message: format!("Batch {} received", batch_index),
                session_id,
            }),
        ),
        BatchOutcome::Complete(session) => {
            let session_id = session.id().to_string();
            tracing::info!("All frames received for session {}. Starting video creation.", session_id);
            spawn_reconstruction(
                state.frame_store.clone(),
                session,
                state.reconstruct.clone(),
                state.metrics.clone(),
            );
            (
                StatusCode::ACCEPTED,
                Json(UploadResponse {
                    status: "processing",
                    message: "Video creation started".to_string(),
                    session_id,
                }),
            )
        }
    };

    Ok(response.into_response())
}

#[instrument(skip(state))]
pub async fn session_status(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Response, UploadError> {
    let status = state
        .frame_store
        .status(&session_id)
        .ok_or(UploadError::UnknownSession(session_id))?;
    Ok(Json(status).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_trims_and_rejects_garbage() {
        assert_eq!(parse_field::<i32>("width", " 640 ".to_string()).unwrap(), 640);
        assert!(matches!(
            parse_field::<usize>("batchIndex", "-1".to_string()),
            Err(UploadError::InvalidField {
                field: "batchIndex",
                ..
            })
        ));
    }

    #[test]
    fn test_status_codes() {
        let conflict = UploadError::Session(SessionError::ReconstructionInProgress("a".into()));
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let stale = UploadError::Session(SessionError::SessionMismatch {
            session: "a".into(),
            expected: "4 frames of 8x8".into(),
            got: "2 frames of 8x8".into(),
        });
        assert_eq!(stale.into_response().status(), StatusCode::CONFLICT);

        let bad = UploadError::Session(SessionError::NoFiles);
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let overflow = UploadError::Session(SessionError::IndexOverflow {
            batch_index: usize::MAX,
            batch_size: 500,
        });
        assert_eq!(overflow.into_response().status(), StatusCode::BAD_REQUEST);

        let missing = UploadError::UnknownSession("a".into());
        assert_eq!(missing.into_response().status(), StatusCode::NOT_FOUND);
    }
}
