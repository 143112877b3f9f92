//! PCM16 little-endian helpers shared by the pipeline stages.

/// Bytes per PCM16 sample.
pub const SAMPLE_BYTES: usize = 2;

/// Computes the root-mean-square amplitude of a sample slice,
/// normalized to `[0, 1]` against full scale.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sum_squares = 0.0f64;
    for &s in samples {
        let normalized = s as f64 / i16::MAX as f64;
        sum_squares += normalized * normalized;
    }
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// Computes the RMS amplitude of raw PCM16 little-endian bytes.
/// A trailing odd byte is ignored.
pub fn rms_bytes(data: &[u8]) -> f32 {
    if data.len() < SAMPLE_BYTES {
        return 0.0;
    }
    let n = data.len() / SAMPLE_BYTES;
    let mut sum_squares = 0.0f64;
    for i in 0..n {
        let s = i16::from_le_bytes([data[2 * i], data[2 * i + 1]]);
        let normalized = s as f64 / i16::MAX as f64;
        sum_squares += normalized * normalized;
    }
    (sum_squares / n as f64).sqrt() as f32
}

/// Decodes PCM16 little-endian bytes into samples.
/// A trailing odd byte is ignored.
pub fn bytes_to_samples(data: &[u8]) -> Vec<i16> {
    let n = data.len() / SAMPLE_BYTES;
    let mut samples = Vec::with_capacity(n);
    for i in 0..n {
        samples.push(i16::from_le_bytes([data[2 * i], data[2 * i + 1]]));
    }
    samples
}

/// Encodes samples as PCM16 little-endian bytes.
pub fn samples_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut data = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
    for &s in samples {
        data.extend_from_slice(&s.to_le_bytes());
    }
    data
}

/// Approximate duration in seconds of a PCM16 mono byte buffer.
pub fn duration_secs(byte_len: usize, sample_rate_hz: u32) -> f32 {
    if sample_rate_hz == 0 {
        return 0.0;
    }
    (byte_len / SAMPLE_BYTES) as f32 / sample_rate_hz as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_of_silence_is_zero() {
        assert_eq!(rms(&[0i16; 160]), 0.0);
        assert_eq!(rms(&[]), 0.0);
    }

    #[test]
    fn rms_of_full_scale_square_is_one() {
        let samples = vec![i16::MAX; 100];
        let value = rms(&samples);
        assert!((value - 1.0).abs() < 1e-4, "got {value}");
    }

    #[test]
    fn rms_bytes_matches_rms() {
        let samples: Vec<i16> = (0..320).map(|i| ((i * 97) % 20000) as i16 - 10000).collect();
        let bytes = samples_to_bytes(&samples);
        assert!((rms(&samples) - rms_bytes(&bytes)).abs() < 1e-6);
    }

    #[test]
    fn sample_byte_roundtrip() {
        let samples = vec![-32768i16, -1, 0, 1, 32767];
        let bytes = samples_to_bytes(&samples);
        assert_eq!(bytes.len(), samples.len() * SAMPLE_BYTES);
        assert_eq!(bytes_to_samples(&bytes), samples);
    }

    #[test]
    fn odd_trailing_byte_is_ignored() {
        let mut bytes = samples_to_bytes(&[100, 200]);
        bytes.push(0x7f);
        assert_eq!(bytes_to_samples(&bytes), vec![100, 200]);
    }

    #[test]
    fn duration_for_16k_mono() {
        // 32000 bytes = 16000 samples = 1 second at 16kHz.
        assert_eq!(duration_secs(32_000, 16_000), 1.0);
        assert_eq!(duration_secs(0, 16_000), 0.0);
        assert_eq!(duration_secs(3_200, 0), 0.0);
    }
}
