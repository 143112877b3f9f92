use thiserror::Error;

/// Errors raised by the assistant session and its transport.
#[derive(Debug, Error)]
pub enum AssistError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session closed")]
    SessionClosed,
}
