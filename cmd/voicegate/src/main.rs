//! voicegate - offline pipeline check.
//!
//! Feeds a synthetic sine sweep through the full capture path: noise
//! conditioning, window aggregation, speaker verification (fallback
//! mode), and the speaker-gated transcription forwarder backed by an
//! in-process collector. Verifies the pipeline end to end without
//! hardware or network access.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use voicegate_audio::capture::{CaptureConfig, CaptureEngine, SineDevice};
use voicegate_transcribe::{
    CollectorService, ForwarderConfig, TranscribeService, TranscriptionForwarder,
};
use voicegate_voiceprint::{SpeakerVerifier, VerifierConfig};

/// Offline check of the capture -> verification -> forwarding pipeline.
#[derive(Parser, Debug)]
#[command(name = "voicegate")]
#[command(about = "Offline check of the capture, verification, and forwarding pipeline")]
struct Args {
    /// Synthetic input duration in seconds
    #[arg(long, default_value_t = 5.0)]
    duration: f32,

    /// Capture sample rate in Hz
    #[arg(long, default_value_t = 16_000)]
    sample_rate: u32,

    /// Window length in milliseconds
    #[arg(long, default_value_t = 960)]
    window_ms: u32,

    /// Sweep start frequency in Hz
    #[arg(long, default_value_t = 200.0)]
    sweep_start: f32,

    /// Sweep end frequency in Hz
    #[arg(long, default_value_t = 2_000.0)]
    sweep_end: f32,

    /// Sweep amplitude, 0 to 1
    #[arg(long, default_value_t = 0.4)]
    amplitude: f32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let window_samples = (args.sample_rate as u64 * args.window_ms as u64 / 1_000) as usize;
    let engine = CaptureEngine::new(window_samples);
    let verifier_windows = engine.subscribe_windows();
    let forwarder_windows = engine.subscribe_windows();

    // No embedding model on this path: verification runs in fallback
    // mode and every speech window is redacted.
    let verifier = SpeakerVerifier::new(VerifierConfig::default(), None);
    let verifier_handle = verifier.spawn(verifier_windows);

    let service = Arc::new(CollectorService::new());
    let mut transcripts = service.transcripts();
    let forwarder = Arc::new(TranscriptionForwarder::new(
        service.clone(),
        verifier_handle.state(),
        ForwarderConfig::default(),
    ));
    forwarder.set_enabled(true).await;
    let forwarder_pump = forwarder.clone().spawn(forwarder_windows);

    let mut config = CaptureConfig::new();
    config.sample_rate_hz = args.sample_rate;
    config.buffer_samples = (args.sample_rate / 10).max(256) as usize;

    info!(
        duration = args.duration,
        sample_rate = args.sample_rate,
        window_samples,
        "running synthetic sweep"
    );
    engine.start(
        Box::new(SineDevice::sweep(
            args.sweep_start,
            args.sweep_end,
            args.duration,
            args.amplitude,
        )),
        config,
    )?;
    engine.join().await;

    // Dropping the engine closes the window subscriptions, letting both
    // pumps drain and exit.
    drop(engine);
    forwarder_pump.await?;
    verifier_handle.join().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let received = service.received();
    let full = received
        .iter()
        .filter(|w| w.len() == window_samples * 2)
        .count();
    let redacted = received
        .iter()
        .filter(|w| w.iter().all(|&b| b == 0))
        .count();
    let bytes: usize = received.iter().map(Vec::len).sum();
    let expected_full =
        (args.duration * args.sample_rate as f32) as usize / window_samples;

    let mut segments = 0;
    while transcripts.try_recv().is_ok() {
        segments += 1;
    }

    println!("windows forwarded: {} ({} full, expected {} full)", received.len(), full, expected_full);
    println!("windows redacted:  {redacted}");
    println!("bytes streamed:    {bytes}");
    println!("transcript segments: {segments}");

    if full != expected_full {
        anyhow::bail!("expected {expected_full} full windows, saw {full}");
    }
    Ok(())
}
