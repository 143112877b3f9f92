//! Playback seam for assistant audio output.

use std::time::Duration;

use async_trait::async_trait;

/// Plays raw PCM and completes when playback has finished, pacing the
/// caller's "speaking" state.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    async fn play(&self, pcm: &[u8], sample_rate_hz: u32, channels: u16);
}

/// Sink that discards audio immediately. Useful in tests.
pub struct NullSink;

#[async_trait]
impl PlaybackSink for NullSink {
    async fn play(&self, _pcm: &[u8], _sample_rate_hz: u32, _channels: u16) {}
}

/// Sink that discards audio but sleeps for its real-time duration, so
/// the speaking state is paced as it would be against hardware.
pub struct TimedSink;

#[async_trait]
impl PlaybackSink for TimedSink {
    async fn play(&self, pcm: &[u8], sample_rate_hz: u32, channels: u16) {
        let samples = pcm.len() / 2 / channels.max(1) as usize;
        if sample_rate_hz == 0 {
            return;
        }
        let millis = samples as u64 * 1_000 / sample_rate_hz as u64;
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn timed_sink_paces_playback() {
        let sink = TimedSink;
        // 1600 samples at 16kHz mono = 100ms.
        let pcm = vec![0u8; 3_200];
        let start = Instant::now();
        sink.play(&pcm, 16_000, 1).await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test]
    async fn null_sink_returns_immediately() {
        NullSink.play(&[0u8; 64_000], 16_000, 1).await;
    }
}
