//! Per-frame noise conditioning: adaptive gain control, high-pass
//! filtering, and a noise gate.
//!
//! The conditioner is a deterministic function of (frame, config, carried
//! filter state). Filter state is carried across frames and must be reset
//! when capture restarts.

use thiserror::Error;

const PCM_SCALE: f32 = 32768.0;

/// Errors raised when a processing configuration violates its invariants.
/// Configurations are rejected eagerly, before any audio flows.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("sample rate must be positive")]
    SampleRate,
    #[error("target RMS must be within [0, 1], got {0}")]
    TargetRms(f32),
    #[error("minimum gain must be positive, got {0}")]
    MinGain(f32),
    #[error("max gain {max} must be >= min gain {min}")]
    GainRange { min: f32, max: f32 },
    #[error("smoothing factor must be within [0, 1), got {0}")]
    Smoothing(f32),
    #[error("high-pass cutoff {cutoff} Hz outside [20, {nyquist}] Hz")]
    HighPassCutoff { cutoff: f32, nyquist: f32 },
}

/// Tunables for [`NoiseConditioner`].
///
/// Derived constants (linear noise floor, high-pass coefficient) are
/// computed once in [`NoiseConditioner::new`] and reused per frame.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    pub sample_rate_hz: u32,
    /// Loudness target the adaptive gain steers toward.
    pub target_rms: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// Gate threshold in dBFS; samples below it are zeroed.
    pub noise_floor_db: f32,
    /// Exponential moving average factor for gain smoothing.
    pub smoothing: f32,
    pub high_pass_cutoff_hz: f32,
}

impl ProcessingConfig {
    /// Returns the default conditioning profile for the given sample rate.
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            target_rms: 0.12,
            min_gain: 0.6,
            max_gain: 4.0,
            noise_floor_db: -55.0,
            smoothing: 0.85,
            high_pass_cutoff_hz: 120.0,
        }
    }

    /// Checks every invariant; returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate_hz == 0 {
            return Err(ConfigError::SampleRate);
        }
        if !(0.0..=1.0).contains(&self.target_rms) {
            return Err(ConfigError::TargetRms(self.target_rms));
        }
        if self.min_gain <= 0.0 {
            return Err(ConfigError::MinGain(self.min_gain));
        }
        if self.max_gain < self.min_gain {
            return Err(ConfigError::GainRange {
                min: self.min_gain,
                max: self.max_gain,
            });
        }
        if !(0.0..1.0).contains(&self.smoothing) {
            return Err(ConfigError::Smoothing(self.smoothing));
        }
        let nyquist = self.sample_rate_hz as f32 / 2.0;
        if !(20.0..=nyquist).contains(&self.high_pass_cutoff_hz) {
            return Err(ConfigError::HighPassCutoff {
                cutoff: self.high_pass_cutoff_hz,
                nyquist,
            });
        }
        Ok(())
    }

    /// Linear amplitude corresponding to the configured noise floor.
    pub fn noise_floor_amplitude(&self) -> f32 {
        10f32.powf(self.noise_floor_db / 20.0)
    }

    /// Single-pole high-pass filter coefficient for the configured cutoff.
    pub fn high_pass_alpha(&self) -> f32 {
        let rc = 1.0 / (2.0 * std::f32::consts::PI * self.high_pass_cutoff_hz);
        let dt = 1.0 / self.sample_rate_hz as f32;
        (rc / (rc + dt)).clamp(0.0, 0.995)
    }
}

/// Stateful per-frame conditioner.
///
/// Processing order per frame: RMS, target gain, gain smoothing,
/// high-pass filter, noise gate, clamp.
pub struct NoiseConditioner {
    noise_floor: f32,
    alpha: f32,
    target_rms: f32,
    min_gain: f32,
    max_gain: f32,
    smoothing: f32,
    prev_input: f32,
    prev_output: f32,
    prev_gain: f32,
}

impl NoiseConditioner {
    /// Validates the config and precomputes derived constants.
    pub fn new(config: ProcessingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            noise_floor: config.noise_floor_amplitude(),
            alpha: config.high_pass_alpha(),
            target_rms: config.target_rms,
            min_gain: config.min_gain,
            max_gain: config.max_gain,
            smoothing: config.smoothing,
            prev_input: 0.0,
            prev_output: 0.0,
            prev_gain: 1.0,
        })
    }

    /// Conditions one frame in place.
    pub fn process(&mut self, samples: &mut [i16]) {
        if samples.is_empty() {
            return;
        }

        let mut floats = Vec::with_capacity(samples.len());
        let mut sum_squares = 0.0f64;
        for &s in samples.iter() {
            let normalized = s as f32 / PCM_SCALE;
            floats.push(normalized);
            sum_squares += (normalized * normalized) as f64;
        }

        let rms = (sum_squares / samples.len() as f64).sqrt() as f32;
        let target_gain = if rms <= 1e-6 {
            self.max_gain
        } else {
            (self.target_rms / rms).clamp(self.min_gain, self.max_gain)
        };

        let gain = self.smoothing * self.prev_gain + (1.0 - self.smoothing) * target_gain;
        self.prev_gain = gain;

        let mut prev_input = self.prev_input;
        let mut prev_output = self.prev_output;

        for (i, out) in samples.iter_mut().enumerate() {
            let input = floats[i];
            let high_passed = self.alpha * (prev_output + input - prev_input);
            prev_input = input;
            prev_output = high_passed;

            let mut processed = high_passed;
            if processed.abs() < self.noise_floor {
                processed = 0.0;
            } else {
                processed *= gain;
            }
            processed = processed.clamp(-1.0, 1.0);

            *out = ((processed * i16::MAX as f32) as i32).clamp(i16::MIN as i32, i16::MAX as i32)
                as i16;
        }

        self.prev_input = prev_input;
        self.prev_output = prev_output;
    }

    /// Clears the carried filter and gain state.
    pub fn reset(&mut self) {
        self.prev_input = 0.0;
        self.prev_output = 0.0;
        self.prev_gain = 1.0;
    }
}
