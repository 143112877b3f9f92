//! Capture engine: drives a [`CaptureDevice`] on a dedicated task and
//! fans conditioned frames and completed windows out to subscribers.
//!
//! Subscribers receive copies over bounded channels with non-blocking
//! sends; a slow consumer loses data rather than stalling capture.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conditioner::{ConfigError, NoiseConditioner, ProcessingConfig};
use crate::window::{AudioWindow, WindowAggregator};

/// Smallest device buffer the engine will accept, in samples.
pub const MIN_DEVICE_BUFFER: usize = 256;

/// Per-subscriber channel depth for frames and windows.
const SUBSCRIBER_DEPTH: usize = 32;

/// Capture parameters handed to the device backend.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub sample_rate_hz: u32,
    pub channels: u16,
    /// Samples per device read.
    pub buffer_samples: usize,
}

impl CaptureConfig {
    /// 16 kHz mono with a 100 ms device buffer.
    pub fn new() -> Self {
        Self {
            sample_rate_hz: 16_000,
            channels: 1,
            buffer_samples: 1_600,
        }
    }

    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.sample_rate_hz == 0 || self.channels == 0 {
            return Err(CaptureError::Config(ConfigError::SampleRate));
        }
        if self.buffer_samples < MIN_DEVICE_BUFFER {
            return Err(CaptureError::Device(format!(
                "device buffer of {} samples is below the minimum of {}",
                self.buffer_samples, MIN_DEVICE_BUFFER
            )));
        }
        Ok(())
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors surfaced by the capture engine.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// Hardware failed to initialize or read. Fatal for this start
    /// attempt; the caller decides whether to retry.
    #[error("audio device unavailable: {0}")]
    Device(String),

    /// A capture session is already running.
    #[error("capture is already running")]
    AlreadyCapturing,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// One frame of captured samples with its capture timestamp.
///
/// Frames are copied, not shared, when fanned out to multiple consumers.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub timestamp_ms: u64,
}

/// Platform capability seam for microphone access.
///
/// The engine only depends on "give me frames of N samples at rate R".
/// Implementations own the underlying hardware handle exclusively for
/// the duration of a session.
pub trait CaptureDevice: Send {
    /// Acquires the device for the given configuration.
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError>;

    /// Blocks until up to `buf.len()` samples are available and returns
    /// the count read. `Ok(0)` signals end of stream.
    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, CaptureError>;

    /// Releases the device. Must be safe to call after a failed open.
    fn close(&mut self);
}

struct ActiveCapture {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

/// Owns the capture task and the fan-out registries.
///
/// The engine conditions every frame in-line on the capture task, then
/// delivers frame copies to frame subscribers and aggregated windows to
/// window subscribers.
pub struct CaptureEngine {
    window_samples: usize,
    frame_subs: Arc<Mutex<Vec<mpsc::Sender<AudioFrame>>>>,
    window_subs: Arc<Mutex<Vec<mpsc::Sender<AudioWindow>>>>,
    active: Mutex<Option<ActiveCapture>>,
}

impl CaptureEngine {
    /// Creates an engine emitting windows of `window_samples` samples.
    pub fn new(window_samples: usize) -> Self {
        Self {
            window_samples,
            frame_subs: Arc::new(Mutex::new(Vec::new())),
            window_subs: Arc::new(Mutex::new(Vec::new())),
            active: Mutex::new(None),
        }
    }

    /// Registers a frame subscriber. Frames arrive as copies; the channel
    /// is bounded and overflow drops frames for this subscriber only.
    pub fn subscribe_frames(&self) -> mpsc::Receiver<AudioFrame> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.frame_subs.lock().unwrap().push(tx);
        rx
    }

    /// Registers a window subscriber.
    pub fn subscribe_windows(&self) -> mpsc::Receiver<AudioWindow> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_DEPTH);
        self.window_subs.lock().unwrap().push(tx);
        rx
    }

    /// Returns whether a capture task is currently running.
    pub fn is_capturing(&self) -> bool {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|a| !a.task.is_finished())
    }

    /// Starts capturing from `device`.
    ///
    /// Fails with [`CaptureError::AlreadyCapturing`] while a session is
    /// active and with [`CaptureError::Device`] when the device cannot be
    /// opened; a failed open is never retried internally.
    pub fn start(
        &self,
        mut device: Box<dyn CaptureDevice>,
        config: CaptureConfig,
    ) -> Result<(), CaptureError> {
        config.validate()?;

        let mut active = self.active.lock().unwrap();
        if active.as_ref().is_some_and(|a| !a.task.is_finished()) {
            return Err(CaptureError::AlreadyCapturing);
        }

        device.open(&config)?;
        let mut conditioner = NoiseConditioner::new(ProcessingConfig::new(config.sample_rate_hz))?;

        info!(
            sample_rate = config.sample_rate_hz,
            buffer = config.buffer_samples,
            "starting audio capture"
        );

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let frame_subs = self.frame_subs.clone();
        let window_subs = self.window_subs.clone();
        let window_samples = self.window_samples;

        let task = tokio::task::spawn_blocking(move || {
            let mut aggregator = WindowAggregator::new(window_samples, move |window| {
                fan_out_window(&window_subs, window);
            });

            let mut buf = vec![0i16; config.buffer_samples];
            loop {
                if task_cancel.is_cancelled() {
                    break;
                }
                match device.read_frame(&mut buf) {
                    Ok(0) => {
                        debug!("capture device reached end of stream");
                        break;
                    }
                    Ok(n) => {
                        let mut chunk = buf[..n].to_vec();
                        conditioner.process(&mut chunk);
                        let timestamp_ms = now_ms();
                        fan_out_frame(&frame_subs, &chunk, timestamp_ms);
                        aggregator.append(&chunk, timestamp_ms);
                    }
                    Err(e) => {
                        error!("capture read failed: {e}");
                        break;
                    }
                }
            }
            aggregator.flush();
            device.close();
            info!("audio capture stopped");
        });

        *active = Some(ActiveCapture { cancel, task });
        Ok(())
    }

    /// Stops the capture task, flushes the in-flight window, and releases
    /// the device. Idempotent.
    pub fn stop(&self) {
        if let Some(active) = self.active.lock().unwrap().take() {
            active.cancel.cancel();
        }
    }

    /// Waits for the capture task to finish. Useful after the device
    /// reports end of stream.
    pub async fn join(&self) {
        let task = self.active.lock().unwrap().take();
        if let Some(active) = task {
            let _ = active.task.await;
        }
    }
}

fn fan_out_frame(subs: &Mutex<Vec<mpsc::Sender<AudioFrame>>>, samples: &[i16], timestamp_ms: u64) {
    let mut subs = subs.lock().unwrap();
    subs.retain(|tx| !tx.is_closed());
    for tx in subs.iter() {
        let frame = AudioFrame {
            samples: samples.to_vec(),
            timestamp_ms,
        };
        if tx.try_send(frame).is_err() {
            warn!("frame subscriber is saturated; dropping frame");
        }
    }
}

fn fan_out_window(subs: &Mutex<Vec<mpsc::Sender<AudioWindow>>>, window: AudioWindow) {
    let mut subs = subs.lock().unwrap();
    subs.retain(|tx| !tx.is_closed());
    for tx in subs.iter() {
        if tx.try_send(window.clone()).is_err() {
            warn!("window subscriber is saturated; dropping window");
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Synthetic capture device producing a linear sine sweep. Used by tests
/// and the offline pipeline check; returns `Ok(0)` once exhausted.
pub struct SineDevice {
    start_hz: f32,
    end_hz: f32,
    amplitude: f32,
    duration_secs: f32,
    total_samples: usize,
    position: usize,
    sample_rate_hz: u32,
    phase: f32,
    open: bool,
}

impl SineDevice {
    /// A sweep from `start_hz` to `end_hz` lasting `duration_secs`.
    pub fn sweep(start_hz: f32, end_hz: f32, duration_secs: f32, amplitude: f32) -> Self {
        Self {
            start_hz,
            end_hz,
            amplitude,
            duration_secs,
            total_samples: 0,
            position: 0,
            sample_rate_hz: 0,
            phase: 0.0,
            open: false,
        }
    }

    /// A fixed tone at `freq_hz`.
    pub fn tone(freq_hz: f32, duration_secs: f32, amplitude: f32) -> Self {
        Self::sweep(freq_hz, freq_hz, duration_secs, amplitude)
    }
}

impl CaptureDevice for SineDevice {
    fn open(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.sample_rate_hz = config.sample_rate_hz;
        self.total_samples = (self.duration_secs * config.sample_rate_hz as f32) as usize;
        self.position = 0;
        self.phase = 0.0;
        self.open = true;
        Ok(())
    }

    fn read_frame(&mut self, buf: &mut [i16]) -> Result<usize, CaptureError> {
        if !self.open {
            return Err(CaptureError::Device("device is not open".into()));
        }
        if self.position >= self.total_samples {
            return Ok(0);
        }
        let n = buf.len().min(self.total_samples - self.position);
        for slot in buf.iter_mut().take(n) {
            let progress = self.position as f32 / self.total_samples as f32;
            let freq = self.start_hz + (self.end_hz - self.start_hz) * progress;
            self.phase += 2.0 * std::f32::consts::PI * freq / self.sample_rate_hz as f32;
            *slot = (self.amplitude * self.phase.sin() * i16::MAX as f32) as i16;
            self.position += 1;
        }
        Ok(n)
    }

    fn close(&mut self) {
        self.open = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validation() {
        assert!(CaptureConfig::new().validate().is_ok());

        let mut cfg = CaptureConfig::new();
        cfg.buffer_samples = 64;
        assert!(matches!(cfg.validate(), Err(CaptureError::Device(_))));

        let mut cfg = CaptureConfig::new();
        cfg.sample_rate_hz = 0;
        assert!(matches!(cfg.validate(), Err(CaptureError::Config(_))));
    }

    #[test]
    fn sine_device_produces_expected_sample_count() {
        let mut device = SineDevice::tone(440.0, 1.0, 0.5);
        device.open(&CaptureConfig::new()).unwrap();

        let mut total = 0usize;
        let mut buf = vec![0i16; 1600];
        loop {
            let n = device.read_frame(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, 16_000);
    }

    #[tokio::test]
    async fn start_while_active_is_rejected() {
        let engine = CaptureEngine::new(15_600);
        engine
            .start(
                Box::new(SineDevice::tone(440.0, 60.0, 0.3)),
                CaptureConfig::new(),
            )
            .unwrap();

        let second = engine.start(
            Box::new(SineDevice::tone(440.0, 1.0, 0.3)),
            CaptureConfig::new(),
        );
        assert!(matches!(second, Err(CaptureError::AlreadyCapturing)));

        engine.stop();
        // Stop is idempotent.
        engine.stop();
    }

    #[tokio::test]
    async fn end_to_end_sweep_produces_full_and_partial_windows() {
        // 5 seconds at 16kHz with ~0.96s windows: 5 full + 1 partial.
        let window_samples = 15_600;
        let engine = CaptureEngine::new(window_samples);
        let mut windows = engine.subscribe_windows();

        engine
            .start(
                Box::new(SineDevice::sweep(200.0, 2_000.0, 5.0, 0.4)),
                CaptureConfig::new(),
            )
            .unwrap();
        engine.join().await;

        let mut collected = Vec::new();
        while let Ok(w) = windows.try_recv() {
            collected.push(w);
        }
        assert_eq!(collected.len(), 6, "expected 5 full windows plus a partial");
        for w in collected.iter().take(5) {
            assert_eq!(w.data.len(), window_samples * 2);
        }
        assert!(collected[5].data.len() < window_samples * 2);
        assert!(!collected[5].data.is_empty());

        // Conditioned output must stay within the noise-floor/gain
        // invariants: non-silent windows, no clipping beyond full scale.
        for w in &collected {
            let rms = crate::pcm::rms_bytes(&w.data);
            assert!(rms > 0.0 && rms <= 1.0);
        }
    }

    #[tokio::test]
    async fn frames_are_fanned_out_to_subscribers() {
        let engine = CaptureEngine::new(1_600);
        let mut frames = engine.subscribe_frames();

        engine
            .start(
                Box::new(SineDevice::tone(440.0, 0.5, 0.3)),
                CaptureConfig::new(),
            )
            .unwrap();
        engine.join().await;

        let mut count = 0;
        while let Ok(frame) = frames.try_recv() {
            assert!(!frame.samples.is_empty());
            count += 1;
        }
        assert!(count >= 4, "expected several frames, got {count}");
    }
}
