use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::IntoResponse,
};

pub const ECHO_PREFIX: &str = "Message text was: ";

pub async fn ws_handler(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(echo)
}

async fn echo(mut socket: WebSocket) {
    tracing::debug!("WebSocket connected");
    while let Some(result) = socket.recv().await {
        match result {
            Ok(Message::Text(text)) => {
                let reply = format!("{}{}", ECHO_PREFIX, text.as_str());
                if socket.send(Message::Text(reply.into())).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("WebSocket receive error: {}", e);
                break;
            }
        }
    }
    tracing::debug!("WebSocket disconnected");
}
