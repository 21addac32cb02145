use crate::server::SharedState;
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Health {
    status: &'static str,
    capture: bool,
    archive_sources: usize,
    buffered_frames: usize,
}

pub async fn healthcheck(State(state): State<SharedState>) -> impl IntoResponse {
    Json(Health {
        status: "Available",
        capture: state.capture.is_some(),
        archive_sources: state.archive.as_ref().map_or(0, |a| a.sources().len()),
        buffered_frames: state.frame_store.buffered_frames(),
    })
}
