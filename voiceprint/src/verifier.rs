//! Per-window speaker verification with model and fallback modes.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use voicegate_audio::pcm;
use voicegate_audio::window::AudioWindow;

use crate::fbank::{cosine_similarity, FeatureConfig, FeatureExtractor};
use crate::model::{EmbeddingModel, ModelInput};
use crate::profile::ProfileStore;
use crate::VerifyError;

/// Verification outcome for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStatus {
    /// The window matches the enrolled profile.
    Match,
    /// The window does not match the enrolled profile.
    Mismatch,
    /// Verification is degraded (no model, shape mismatch, or inference
    /// failure); the result is non-authoritative.
    Unknown,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => write!(f, "match"),
            Self::Mismatch => write!(f, "mismatch"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Latest verification observation. Published as a single overwritable
/// value; readers always see the newest state.
#[derive(Debug, Clone)]
pub struct VerificationState {
    pub status: VerificationStatus,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub timestamp_ms: u64,
}

impl VerificationState {
    /// The initial state before any window has been evaluated.
    pub fn unknown() -> Self {
        Self {
            status: VerificationStatus::Unknown,
            confidence: 0.0,
            timestamp_ms: 0,
        }
    }
}

/// Tunables for [`SpeakerVerifier`].
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Cosine similarity at or above which a window counts as a match.
    pub match_threshold: f32,
    /// Divisor mapping window RMS to the fallback pseudo-confidence.
    pub fallback_rms_divisor: f32,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.6,
            fallback_rms_divisor: 0.4,
        }
    }
}

/// Evaluates audio windows against the enrolled reference embedding.
///
/// The reference embedding is derived once from the enrolled clips and
/// cached for the life of a capture session; [`reset`](Self::reset)
/// clears it and the published state.
pub struct SpeakerVerifier {
    config: VerifierConfig,
    model: Option<Arc<dyn EmbeddingModel>>,
    extractor: Option<FeatureExtractor>,
    reference: Option<Vec<f32>>,
    state_tx: watch::Sender<VerificationState>,
    state_rx: watch::Receiver<VerificationState>,
}

impl SpeakerVerifier {
    /// Creates a verifier. Passing `None` for the model selects fallback
    /// mode for every window.
    pub fn new(config: VerifierConfig, model: Option<Arc<dyn EmbeddingModel>>) -> Self {
        let extractor = match model.as_deref().map(EmbeddingModel::input) {
            Some(ModelInput::LogMel { mels, .. }) => {
                let cfg = FeatureConfig {
                    num_mels: mels,
                    ..FeatureConfig::default()
                };
                match FeatureExtractor::new(cfg) {
                    Ok(e) => Some(e),
                    Err(e) => {
                        warn!("feature extractor unavailable ({e}); verification degrades to fallback");
                        None
                    }
                }
            }
            _ => None,
        };

        let (state_tx, state_rx) = watch::channel(VerificationState::unknown());
        Self {
            config,
            model,
            extractor,
            reference: None,
            state_tx,
            state_rx,
        }
    }

    /// Subscribes to the latest verification state.
    pub fn state(&self) -> watch::Receiver<VerificationState> {
        self.state_rx.clone()
    }

    /// Whether a reference embedding is loaded.
    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Derives and caches the reference embedding as the mean embedding
    /// over every full-length slice of every clip. Returns the number of
    /// embeddings averaged; zero clips leave the verifier ungated.
    pub fn derive_reference(&mut self, clips: &[Vec<u8>]) -> Result<usize, VerifyError> {
        let model = self.model.clone().ok_or(VerifyError::ModelUnavailable)?;
        if clips.is_empty() {
            debug!("no enrolled clips; running without a speaker gating profile");
            return Ok(0);
        }

        let span = self.input_span(model.input()).max(1);
        let dim = model.output_dim();
        let mut accumulator = vec![0.0f32; dim];
        let mut count = 0usize;

        for clip in clips {
            let samples = pcm::bytes_to_samples(clip);
            let mut offset = 0;
            while offset < samples.len() {
                let end = (offset + span).min(samples.len());
                match self.build_input(&samples[offset..end], model.input()) {
                    Ok(input) => match model.infer(&input) {
                        Ok(embedding) if embedding.len() == dim => {
                            for (acc, v) in accumulator.iter_mut().zip(embedding.iter()) {
                                *acc += v;
                            }
                            count += 1;
                        }
                        Ok(embedding) => {
                            warn!(
                                "reference embedding has dimension {}, expected {dim}; skipping",
                                embedding.len()
                            );
                        }
                        Err(e) => warn!("reference embedding inference failed: {e}"),
                    },
                    Err(e) => warn!("reference input preparation failed: {e}"),
                }
                offset += span;
            }
        }

        if count == 0 {
            return Err(VerifyError::Model(
                "unable to derive a reference embedding from the enrolled clips".into(),
            ));
        }
        for v in accumulator.iter_mut() {
            *v /= count as f32;
        }
        info!("loaded speaker profile from {count} embeddings");
        self.reference = Some(accumulator);
        Ok(count)
    }

    /// Loads the persisted enrollment clips and derives the reference
    /// embedding from them. Missing or empty profiles leave the verifier
    /// ungated and return zero.
    pub fn load_reference(&mut self, store: &ProfileStore) -> Result<usize, VerifyError> {
        let clips = store.load()?;
        if clips.is_empty() {
            debug!("no voice profile found; running without speaker gating");
            return Ok(0);
        }
        self.derive_reference(&clips)
    }

    /// Clears the cached reference and publishes the unknown state.
    pub fn reset(&mut self) {
        self.reference = None;
        self.state_tx.send_replace(VerificationState::unknown());
    }

    /// Evaluates one window and publishes the resulting state.
    pub fn accept_window(&mut self, data: &[u8], timestamp_ms: u64) {
        if data.is_empty() {
            return;
        }
        let (status, confidence) = self.verify(data);
        self.state_tx.send_replace(VerificationState {
            status,
            confidence,
            timestamp_ms,
        });
    }

    fn verify(&self, data: &[u8]) -> (VerificationStatus, f32) {
        let Some(model) = self.model.as_ref() else {
            return self.fallback(data);
        };

        let samples = pcm::bytes_to_samples(data);
        let input = match self.build_input(&samples, model.input()) {
            Ok(input) => input,
            Err(e) => {
                warn!("model input unavailable ({e}); using fallback");
                return self.fallback(data);
            }
        };

        match model.infer(&input) {
            Ok(embedding) => {
                let confidence = match &self.reference {
                    Some(reference) => {
                        cosine_similarity(&embedding, reference).clamp(0.0, 1.0)
                    }
                    None => embedding.first().copied().unwrap_or(0.0).clamp(0.0, 1.0),
                };
                let status = if confidence >= self.config.match_threshold {
                    VerificationStatus::Match
                } else {
                    VerificationStatus::Mismatch
                };
                (status, confidence)
            }
            Err(e) => {
                warn!("speaker verification inference failed: {e}");
                self.fallback(data)
            }
        }
    }

    /// Energy heuristic used when inference is unavailable. Never reports
    /// match or mismatch.
    fn fallback(&self, data: &[u8]) -> (VerificationStatus, f32) {
        let rms = pcm::rms_bytes(data);
        let confidence = (rms / self.config.fallback_rms_divisor).min(1.0);
        (VerificationStatus::Unknown, confidence)
    }

    fn input_span(&self, input: ModelInput) -> usize {
        match input {
            ModelInput::RawPcm { samples } => samples,
            ModelInput::LogMel { frames, .. } => match &self.extractor {
                Some(extractor) => extractor.span_samples(frames),
                None => frames * FeatureConfig::default().frame_shift,
            },
        }
    }

    fn build_input(&self, samples: &[i16], input: ModelInput) -> Result<Vec<f32>, VerifyError> {
        match input {
            ModelInput::RawPcm { samples: required } => {
                let mut prepared = vec![0.0f32; required];
                for (slot, &s) in prepared.iter_mut().zip(samples.iter()) {
                    *slot = s as f32 / i16::MAX as f32;
                }
                Ok(prepared)
            }
            ModelInput::LogMel { frames, mels } => {
                let extractor = self.extractor.as_ref().ok_or_else(|| {
                    VerifyError::ShapeMismatch("no feature extractor for log-mel input".into())
                })?;
                if extractor.config().num_mels != mels {
                    return Err(VerifyError::ShapeMismatch(format!(
                        "extractor produces {} mel bins, model expects {mels}",
                        extractor.config().num_mels
                    )));
                }
                let feature_frames = extractor.extract(samples, frames);
                let mut flattened = Vec::with_capacity(frames * mels);
                for frame in feature_frames {
                    flattened.extend_from_slice(&frame);
                }
                Ok(flattened)
            }
        }
    }

    /// Moves the verifier onto a pump task consuming windows until the
    /// channel closes or the handle stops it.
    pub fn spawn(mut self, mut windows: mpsc::Receiver<AudioWindow>) -> VerifierHandle {
        let state = self.state_rx.clone();
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    window = windows.recv() => match window {
                        Some(w) => self.accept_window(&w.data, w.timestamp_ms),
                        None => break,
                    },
                }
            }
        });
        VerifierHandle {
            state,
            cancel,
            task,
        }
    }
}

/// Handle to a running verification pump.
pub struct VerifierHandle {
    state: watch::Receiver<VerificationState>,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl VerifierHandle {
    pub fn state(&self) -> watch::Receiver<VerificationState> {
        self.state.clone()
    }

    /// Cancels the pump. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the pump task to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::PI;

    /// Deterministic test model: the embedding is the signal's magnitude
    /// response at eight probe frequencies, so same-frequency voices are
    /// nearly collinear and distant frequencies nearly orthogonal.
    struct BandEnergyModel {
        samples: usize,
    }

    const PROBE_HZ: [f32; 8] = [200.0, 400.0, 800.0, 1200.0, 1600.0, 2400.0, 3200.0, 4000.0];
    const SAMPLE_RATE: f32 = 16_000.0;

    impl EmbeddingModel for BandEnergyModel {
        fn input(&self) -> ModelInput {
            ModelInput::RawPcm {
                samples: self.samples,
            }
        }

        fn output_dim(&self) -> usize {
            PROBE_HZ.len()
        }

        fn infer(&self, input: &[f32]) -> Result<Vec<f32>, VerifyError> {
            let mut embedding = Vec::with_capacity(PROBE_HZ.len());
            for &freq in &PROBE_HZ {
                let mut re = 0.0f32;
                let mut im = 0.0f32;
                for (i, &x) in input.iter().enumerate() {
                    let angle = 2.0 * PI * freq * i as f32 / SAMPLE_RATE;
                    re += x * angle.cos();
                    im += x * angle.sin();
                }
                embedding.push((re * re + im * im).sqrt() / input.len() as f32);
            }
            Ok(embedding)
        }
    }

    struct FailingModel;

    impl EmbeddingModel for FailingModel {
        fn input(&self) -> ModelInput {
            ModelInput::RawPcm { samples: 1_000 }
        }
        fn output_dim(&self) -> usize {
            4
        }
        fn infer(&self, _input: &[f32]) -> Result<Vec<f32>, VerifyError> {
            Err(VerifyError::Model("interpreter crashed".into()))
        }
    }

    fn sine_bytes(freq_hz: f32, amplitude: f32, n: usize) -> Vec<u8> {
        let samples: Vec<i16> = (0..n)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE;
                (amplitude * (2.0 * PI * freq_hz * t).sin() * i16::MAX as f32) as i16
            })
            .collect();
        pcm::samples_to_bytes(&samples)
    }

    fn model_verifier() -> SpeakerVerifier {
        SpeakerVerifier::new(
            VerifierConfig::default(),
            Some(Arc::new(BandEnergyModel { samples: 8_000 })),
        )
    }

    #[test]
    fn same_voice_matches_with_high_confidence() {
        let mut verifier = model_verifier();
        let clips = vec![sine_bytes(400.0, 0.5, 16_000)];
        assert!(verifier.derive_reference(&clips).unwrap() > 0);

        verifier.accept_window(&sine_bytes(400.0, 0.4, 8_000), 10);
        let state = verifier.state().borrow().clone();
        assert_eq!(state.status, VerificationStatus::Match);
        assert!(state.confidence >= 0.6, "confidence {}", state.confidence);
        assert_eq!(state.timestamp_ms, 10);
    }

    #[test]
    fn different_voice_mismatches_with_low_confidence() {
        let mut verifier = model_verifier();
        verifier
            .derive_reference(&[sine_bytes(400.0, 0.5, 16_000)])
            .unwrap();

        verifier.accept_window(&sine_bytes(3_200.0, 0.4, 8_000), 20);
        let state = verifier.state().borrow().clone();
        assert_eq!(state.status, VerificationStatus::Mismatch);
        assert!(state.confidence <= 0.35, "confidence {}", state.confidence);
    }

    #[test]
    fn silent_candidate_has_zero_confidence() {
        let mut verifier = model_verifier();
        verifier
            .derive_reference(&[sine_bytes(400.0, 0.5, 16_000)])
            .unwrap();

        verifier.accept_window(&vec![0u8; 16_000], 30);
        let state = verifier.state().borrow().clone();
        assert_eq!(state.confidence, 0.0);
        assert_eq!(state.status, VerificationStatus::Mismatch);
    }

    #[test]
    fn missing_model_falls_back_to_unknown() {
        let mut verifier = SpeakerVerifier::new(VerifierConfig::default(), None);
        let window = sine_bytes(440.0, 0.2, 8_000);
        let expected = (pcm::rms_bytes(&window) / 0.4).min(1.0);

        verifier.accept_window(&window, 40);
        let state = verifier.state().borrow().clone();
        assert_eq!(state.status, VerificationStatus::Unknown);
        assert!((state.confidence - expected).abs() < 1e-6);
    }

    #[test]
    fn inference_failure_degrades_to_fallback() {
        let mut verifier =
            SpeakerVerifier::new(VerifierConfig::default(), Some(Arc::new(FailingModel)));
        verifier.accept_window(&sine_bytes(440.0, 0.9, 2_000), 50);
        let state = verifier.state().borrow().clone();
        assert_eq!(state.status, VerificationStatus::Unknown);
        assert!(state.confidence <= 1.0);
    }

    #[test]
    fn without_reference_first_dimension_is_confidence() {
        let mut verifier = model_verifier();
        assert!(!verifier.has_reference());
        verifier.accept_window(&sine_bytes(200.0, 0.9, 8_000), 60);
        let state = verifier.state().borrow().clone();
        // No profile: status derives from the raw first output value.
        assert!(state.confidence >= 0.0 && state.confidence <= 1.0);
    }

    #[test]
    fn reset_clears_reference_and_state() {
        let mut verifier = model_verifier();
        verifier
            .derive_reference(&[sine_bytes(400.0, 0.5, 16_000)])
            .unwrap();
        verifier.accept_window(&sine_bytes(400.0, 0.4, 8_000), 70);

        verifier.reset();
        assert!(!verifier.has_reference());
        let state = verifier.state().borrow().clone();
        assert_eq!(state.status, VerificationStatus::Unknown);
        assert_eq!(state.confidence, 0.0);
    }

    #[test]
    fn derive_reference_without_model_errors() {
        let mut verifier = SpeakerVerifier::new(VerifierConfig::default(), None);
        assert!(matches!(
            verifier.derive_reference(&[vec![0u8; 100]]),
            Err(VerifyError::ModelUnavailable)
        ));
    }

    #[tokio::test]
    async fn pump_publishes_latest_state_and_stops() {
        let verifier = SpeakerVerifier::new(VerifierConfig::default(), None);
        let (tx, rx) = mpsc::channel(8);
        let handle = verifier.spawn(rx);
        let mut state = handle.state();

        tx.send(AudioWindow {
            data: sine_bytes(440.0, 0.3, 4_000),
            timestamp_ms: 123,
        })
        .await
        .unwrap();

        state.changed().await.unwrap();
        assert_eq!(state.borrow().timestamp_ms, 123);

        handle.stop();
        handle.join().await;
    }
}
