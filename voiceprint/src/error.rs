use thiserror::Error;

/// Errors raised by feature extraction and embedding inference.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("embedding model unavailable")]
    ModelUnavailable,

    #[error("model input shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("invalid feature configuration: {0}")]
    InvalidConfig(String),

    #[error("model error: {0}")]
    Model(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised while enrolling a voice profile.
#[derive(Debug, Error)]
pub enum EnrollError {
    #[error("no enrollment clips provided")]
    NoClips,

    #[error("enrollment clip {index} is empty")]
    EmptyClip { index: usize },

    #[error("insufficient signal energy: mean RMS {mean_rms:.4} below minimum {min_rms:.4}")]
    InsufficientSignal { mean_rms: f32, min_rms: f32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
