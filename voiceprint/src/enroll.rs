//! Recording and validation of voice enrollment clips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::watch;
use tracing::{debug, info};

use voicegate_audio::pcm;

use crate::profile::ProfileStore;
use crate::EnrollError;

/// Tunables for [`EnrollmentManager`].
#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    pub sample_rate_hz: u32,
    /// Mean clip RMS below this rejects the enrollment as too quiet.
    pub min_energy_rms: f32,
    /// Gain applied to the live amplitude published for UI meters.
    pub amplitude_gain: f32,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            min_energy_rms: 0.015,
            amplitude_gain: 4.0,
        }
    }
}

/// Records labeled utterances and finalizes them into a voice profile.
///
/// At most one clip records at a time; starting while recording fails
/// with an explicit `false` rather than panicking. Recording is expected
/// to be mutually exclusive with normal capture — the caller tears down
/// the regular pipeline before feeding chunks here.
pub struct EnrollmentManager {
    config: EnrollmentConfig,
    store: ProfileStore,
    recording: AtomicBool,
    chunks: Mutex<Vec<Vec<u8>>>,
    amplitude_tx: watch::Sender<f32>,
    amplitude_rx: watch::Receiver<f32>,
}

impl EnrollmentManager {
    pub fn new(config: EnrollmentConfig, store: ProfileStore) -> Self {
        let (amplitude_tx, amplitude_rx) = watch::channel(0.0);
        Self {
            config,
            store,
            recording: AtomicBool::new(false),
            chunks: Mutex::new(Vec::new()),
            amplitude_tx,
            amplitude_rx,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// Live input amplitude in `[0, 1]`, for UI feedback while recording.
    pub fn amplitude(&self) -> watch::Receiver<f32> {
        self.amplitude_rx.clone()
    }

    /// Starts buffering a new clip. Returns `false` when a clip is
    /// already recording.
    pub fn begin_clip(&self) -> bool {
        if self
            .recording
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.chunks.lock().unwrap().clear();
        self.amplitude_tx.send_replace(0.0);
        debug!("enrollment clip recording started");
        true
    }

    /// Buffers one captured chunk. Ignored while not recording.
    pub fn push_chunk(&self, samples: &[i16]) {
        if !self.is_recording() {
            return;
        }
        let amplitude = (pcm::rms(samples) * self.config.amplitude_gain).clamp(0.0, 1.0);
        self.amplitude_tx.send_replace(amplitude);
        self.chunks.lock().unwrap().push(pcm::samples_to_bytes(samples));
    }

    /// Stops recording and returns the concatenated clip bytes.
    /// Returns an empty buffer when no recording was active.
    pub fn end_clip(&self) -> Vec<u8> {
        if self
            .recording
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Vec::new();
        }
        self.amplitude_tx.send_replace(0.0);
        let mut chunks = self.chunks.lock().unwrap();
        let total: usize = chunks.iter().map(Vec::len).sum();
        let mut clip = Vec::with_capacity(total);
        for chunk in chunks.drain(..) {
            clip.extend_from_slice(&chunk);
        }
        debug!(bytes = clip.len(), "enrollment clip recording stopped");
        clip
    }

    /// Discards the in-flight clip, if any.
    pub fn cancel_clip(&self) {
        if self
            .recording
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.chunks.lock().unwrap().clear();
            self.amplitude_tx.send_replace(0.0);
            debug!("enrollment clip recording cancelled");
        }
    }

    /// RMS of a recorded clip, for UI feedback.
    pub fn clip_rms(clip: &[u8]) -> f32 {
        pcm::rms_bytes(clip)
    }

    /// Approximate clip duration in seconds.
    pub fn clip_duration_secs(&self, clip: &[u8]) -> f32 {
        pcm::duration_secs(clip.len(), self.config.sample_rate_hz)
    }

    /// Validates the recorded clips and persists them as the new voice
    /// profile, replacing any previous one. No partial profile is ever
    /// written: validation failures leave the store untouched.
    pub fn finalize(&self, clips: &[Vec<u8>]) -> Result<(), EnrollError> {
        if clips.is_empty() {
            return Err(EnrollError::NoClips);
        }
        if let Some(index) = clips.iter().position(|c| c.is_empty()) {
            return Err(EnrollError::EmptyClip { index });
        }

        let mean_rms =
            clips.iter().map(|c| pcm::rms_bytes(c)).sum::<f32>() / clips.len() as f32;
        if mean_rms < self.config.min_energy_rms {
            return Err(EnrollError::InsufficientSignal {
                mean_rms,
                min_rms: self.config.min_energy_rms,
            });
        }

        self.store.save(clips)?;
        info!(clips = clips.len(), "voice profile enrolled");
        Ok(())
    }
}
