use crate::VerifyError;

/// Input layout an [`EmbeddingModel`] expects, chosen once per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelInput {
    /// Raw normalized PCM samples, `samples` values in `[-1, 1]`.
    RawPcm { samples: usize },
    /// Log-mel feature frames, flattened row-major to `frames * mels`.
    LogMel { frames: usize, mels: usize },
}

/// Speaker embedding inference seam.
///
/// Implementations wrap whatever inference backend is available on the
/// device; the verifier prepares the input according to
/// [`ModelInput`] and compares embeddings via cosine similarity.
///
/// # Thread Safety
///
/// Implementations must be safe for concurrent use.
pub trait EmbeddingModel: Send + Sync {
    /// The input layout this model consumes.
    fn input(&self) -> ModelInput;

    /// Dimensionality of the produced embedding vectors.
    fn output_dim(&self) -> usize;

    /// Runs inference over a prepared input vector.
    fn infer(&self, input: &[f32]) -> Result<Vec<f32>, VerifyError>;
}
