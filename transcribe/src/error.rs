use thiserror::Error;

/// Errors raised by transcription streaming.
#[derive(Debug, Error)]
pub enum TranscribeError {
    #[error("failed to start transcription session: {0}")]
    SessionStart(String),

    #[error("transcription session {0} is closed")]
    SessionClosed(String),
}
