//! Real-time microphone capture pipeline.
//!
//! This crate provides the capture-side building blocks:
//!
//! - [`pcm`]: PCM16 little-endian helpers (RMS, byte/sample conversion)
//! - [`conditioner`]: adaptive gain, high-pass filtering, and noise gating
//! - [`window`]: aggregation of frames into fixed-size timestamped windows
//! - [`capture`]: the capture engine driving a [`capture::CaptureDevice`]
//!   and fanning frames and windows out to subscribers
//!
//! # Example
//!
//! ```rust
//! use voicegate_audio::conditioner::{NoiseConditioner, ProcessingConfig};
//!
//! let config = ProcessingConfig::new(16_000);
//! let mut conditioner = NoiseConditioner::new(config).unwrap();
//!
//! let mut frame = vec![0i16; 1600];
//! conditioner.process(&mut frame);
//! ```

pub mod capture;
pub mod conditioner;
pub mod pcm;
pub mod window;

pub use capture::{AudioFrame, CaptureConfig, CaptureDevice, CaptureEngine, CaptureError, SineDevice};
pub use conditioner::{ConfigError, NoiseConditioner, ProcessingConfig};
pub use window::{AudioWindow, WindowAggregator};
