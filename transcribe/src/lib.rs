//! Streaming transcription: transcript types, the external service
//! contract, and the speaker-gated forwarder.
//!
//! The forwarder sits between the capture pipeline and a cloud
//! transcription session. Each audio window is either forwarded verbatim
//! (ambient sound, or speech attributed to the enrolled speaker) or
//! replaced by a zero-filled buffer of identical length, preserving the
//! timing of the stream without leaking unverified speech.

mod error;
mod forwarder;
mod service;
mod transcript;

pub use error::TranscribeError;
pub use forwarder::{ForwarderConfig, StreamingState, TranscriptionForwarder};
pub use service::{CollectorService, SessionHandle, TranscribeService};
pub use transcript::{ItemKind, Transcript, TranscriptItem};
