use crate::{
    server::SharedState,
    skeleton::{load_skeleton_data, SkeletonError},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error serving data: {0}")]
    Skeleton(#[from] SkeletonError),
    #[error("Error serving data: {0}")]
    Task(String),
}

impl IntoResponse for DataError {
    fn into_response(self) -> Response {
        let status = match &self {
            DataError::Skeleton(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!("{}", self);
        (status, self.to_string()).into_response()
    }
}

/// Reloads the trajectory array on every call; nothing is cached.
#[instrument(skip(state))]
pub async fn get_data(State(state): State<SharedState>) -> Result<Response, DataError> {
    state.metrics.record_request("/data");

    let path = state.recording.get_data_path();
    let tracker_type = state.recording.tracker_type.clone();
    let data = tokio::task::spawn_blocking(move || load_skeleton_data(&path, &tracker_type))
        .await
        .map_err(|e| DataError::Task(e.to_string()))??;

    tracing::debug!(
        "Serving {} frames of {} markers",
        data.num_frames,
        data.markers.len()
    );
    Ok(Json(data).into_response())
}
