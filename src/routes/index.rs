use crate::server::SharedState;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};

pub async fn get_index(State(state): State<SharedState>) -> Response {
    let path = &state.recording.index_html;
    tracing::info!("Serving {:?}", path);
    match tokio::fs::read_to_string(path).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::error!("Failed to read {:?}: {}", path, e);
            (StatusCode::NOT_FOUND, "Index page not found").into_response()
        }
    }
}
