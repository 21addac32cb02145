mod data;
mod frames;
mod health;
mod index;
mod metrics;
mod upload;
mod ws;

use crate::server::SharedState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub use ws::ECHO_PREFIX;

pub fn api_routes(upload_body_limit: usize) -> Router<SharedState> {
    Router::new()
        .route("/", get(index::get_index))
        .route("/health", get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler))
        .route("/data", get(data::get_data))
        .route(
            "/upload-frames",
            post(upload::upload_frames).layer(DefaultBodyLimit::max(upload_body_limit)),
        )
        .route(
            "/upload-frames/{session_id}/status",
            get(upload::session_status),
        )
        .route("/video/frame/{index}", get(frames::get_frame))
        .route("/video/frames/{index}", get(frames::get_archived_frames))
        .route("/video-info", get(frames::video_info))
        .route("/ws", get(ws::ws_handler))
}
