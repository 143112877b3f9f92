//! Log-mel filterbank feature extraction from PCM16 audio.
//!
//! Short-time analysis with a Hann window and a radix-2 FFT, followed by
//! a triangular mel filterbank. The extractor always produces the frame
//! count the caller asks for, zero-padding short input.

use std::f64::consts::PI;

use crate::VerifyError;

const ENERGY_FLOOR: f64 = 1e-10;

/// Configures log-mel feature extraction.
///
/// Defaults target speaker-embedding models at 16 kHz: 25 ms frames with
/// a 10 ms shift, 512-point FFT, 64 mel channels over 125-7500 Hz.
#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Input sample rate in Hz.
    pub sample_rate_hz: usize,
    /// Frame length in samples (default: 400 = 25ms @ 16kHz).
    pub frame_length: usize,
    /// Frame shift in samples (default: 160 = 10ms @ 16kHz).
    pub frame_shift: usize,
    /// FFT size; must be a power of two >= frame length (default: 512).
    pub fft_size: usize,
    /// Number of mel filterbank channels (default: 64).
    pub num_mels: usize,
    /// Lower edge of the mel filterbank in Hz (default: 125).
    pub low_hz: f64,
    /// Upper edge of the mel filterbank in Hz, capped at Nyquist
    /// (default: 7500).
    pub high_hz: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 16_000,
            frame_length: 400,
            frame_shift: 160,
            fft_size: 512,
            num_mels: 64,
            low_hz: 125.0,
            high_hz: 7_500.0,
        }
    }
}

/// Precomputed Hann window and mel filterbank for repeated extraction.
pub struct FeatureExtractor {
    cfg: FeatureConfig,
    spectrum_size: usize,
    window: Vec<f64>,
    filterbank: Vec<Vec<f64>>,
}

impl FeatureExtractor {
    /// Validates the configuration and precomputes the window and
    /// filterbank weights.
    pub fn new(cfg: FeatureConfig) -> Result<Self, VerifyError> {
        if cfg.sample_rate_hz == 0 || cfg.frame_length == 0 || cfg.frame_shift == 0 {
            return Err(VerifyError::InvalidConfig(
                "sample rate, frame length, and frame shift must be positive".into(),
            ));
        }
        if cfg.num_mels == 0 {
            return Err(VerifyError::InvalidConfig("mel bin count must be positive".into()));
        }
        if !cfg.fft_size.is_power_of_two() || cfg.fft_size < cfg.frame_length {
            return Err(VerifyError::InvalidConfig(format!(
                "FFT size {} must be a power of two >= frame length {}",
                cfg.fft_size, cfg.frame_length
            )));
        }

        let spectrum_size = cfg.fft_size / 2 + 1;
        let window = hann_window(cfg.frame_length);
        let filterbank = mel_filterbank(&cfg, spectrum_size);
        Ok(Self {
            cfg,
            spectrum_size,
            window,
            filterbank,
        })
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    /// Samples spanned by `frame_count` frames.
    pub fn span_samples(&self, frame_count: usize) -> usize {
        self.cfg.frame_shift * (frame_count.max(1) - 1) + self.cfg.frame_length
    }

    /// Extracts exactly `frame_count` log-mel frames, zero-padding input
    /// shorter than the required span.
    pub fn extract(&self, samples: &[i16], frame_count: usize) -> Vec<Vec<f32>> {
        let required = self.span_samples(frame_count);
        let mut normalized = vec![0.0f64; required];
        for (i, &s) in samples.iter().take(required).enumerate() {
            normalized[i] = s as f64 / i16::MAX as f64;
        }

        let mut frames = Vec::with_capacity(frame_count);
        let mut fft_buf = vec![(0.0f64, 0.0f64); self.cfg.fft_size];

        for frame_index in 0..frame_count {
            let offset = frame_index * self.cfg.frame_shift;

            for v in fft_buf.iter_mut() {
                *v = (0.0, 0.0);
            }
            for n in 0..self.cfg.frame_length {
                fft_buf[n] = (normalized[offset + n] * self.window[n], 0.0);
            }

            fft(&mut fft_buf);

            let mut spectrum = vec![0.0f64; self.spectrum_size];
            for (k, slot) in spectrum.iter_mut().enumerate() {
                let (re, im) = fft_buf[k];
                *slot = re * re + im * im;
            }

            let mut mel_energies = vec![0.0f32; self.cfg.num_mels];
            for (m, weights) in self.filterbank.iter().enumerate() {
                let mut energy = 0.0f64;
                for (k, &w) in weights.iter().enumerate() {
                    energy += w * spectrum[k];
                }
                mel_energies[m] = (energy + ENERGY_FLOOR).ln() as f32;
            }
            frames.push(mel_energies);
        }
        frames
    }
}

fn hann_window(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
        .collect()
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10.0f64.powf(mel / 2595.0) - 1.0)
}

/// Triangular mel filterbank weights, `[num_mels][spectrum_size]`.
fn mel_filterbank(cfg: &FeatureConfig, spectrum_size: usize) -> Vec<Vec<f64>> {
    let nyquist = cfg.sample_rate_hz as f64 / 2.0;
    let mel_low = hz_to_mel(cfg.low_hz);
    let mel_high = hz_to_mel(cfg.high_hz.min(nyquist));
    let mel_range = mel_high - mel_low;

    let bin_points: Vec<usize> = (0..cfg.num_mels + 2)
        .map(|i| {
            let mel = mel_low + i as f64 / (cfg.num_mels + 1) as f64 * mel_range;
            let hz = mel_to_hz(mel);
            let bin = ((cfg.fft_size + 1) as f64 * hz / cfg.sample_rate_hz as f64) as isize;
            bin.clamp(0, spectrum_size as isize - 1) as usize
        })
        .collect();

    let mut filters = Vec::with_capacity(cfg.num_mels);
    for m in 0..cfg.num_mels {
        let mut filter = vec![0.0f64; spectrum_size];
        let left = bin_points[m];
        let center = bin_points[m + 1];
        let right = bin_points[m + 2];

        if center > left && right > center {
            for k in left..center {
                filter[k] = (k - left) as f64 / (center - left) as f64;
            }
            for k in center..right {
                filter[k] = (right - k) as f64 / (right - center) as f64;
            }
        }
        filters.push(filter);
    }
    filters
}

/// In-place radix-2 Cooley-Tukey FFT over (real, imag) tuples.
/// Input length must be a power of two.
fn fft(x: &mut [(f64, f64)]) {
    let n = x.len();
    if n <= 1 {
        return;
    }

    // Bit-reversal permutation.
    let mut j = 0usize;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j ^= bit;
        if i < j {
            x.swap(i, j);
        }
    }

    let mut size = 2;
    while size <= n {
        let half = size / 2;
        let angle = -2.0 * PI / size as f64;
        let step = (angle.cos(), angle.sin());
        let mut start = 0;
        while start < n {
            let mut w = (1.0f64, 0.0f64);
            for k in 0..half {
                let a = x[start + k];
                let b = x[start + k + half];
                let t = (w.0 * b.0 - w.1 * b.1, w.0 * b.1 + w.1 * b.0);
                x[start + k] = (a.0 + t.0, a.1 + t.1);
                x[start + k + half] = (a.0 - t.0, a.1 - t.1);
                w = (w.0 * step.0 - w.1 * step.1, w.0 * step.1 + w.1 * step.0);
            }
            start += size;
        }
        size <<= 1;
    }
}

/// Cosine similarity of two equal-length vectors, clamped to `[-1, 1]`.
/// Returns 0 for empty, mismatched, or zero-norm inputs.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        dot += x as f64 * y as f64;
        norm_a += x as f64 * x as f64;
        norm_b += y as f64 * y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    ((dot / (norm_a.sqrt() * norm_b.sqrt())) as f32).clamp(-1.0, 1.0)
}
