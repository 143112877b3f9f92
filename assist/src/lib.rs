//! Bidirectional streaming session toward a conversational model
//! endpoint.
//!
//! A session exchanges JSON event envelopes over a persistent stream:
//! outbound `sessionStart`, `audioInput`, `sessionHeartbeat`, and
//! `sessionEnd`; inbound `textOutput`, `audioOutput`, and `contentEnd`.
//! [`AssistSessionManager`] owns the lifecycle (connect, heartbeat,
//! idle timeout, teardown), ingests microphone frames through a bounded
//! drop-oldest queue, and dispatches inbound events to a
//! [`PlaybackSink`] and the observable [`AssistState`].

mod error;
pub mod event;
mod player;
mod session;
mod transport;

pub use error::AssistError;
pub use event::{ClientEvent, InferenceConfiguration, ServerEnvelope, ServerEvent};
pub use player::{NullSink, PlaybackSink, TimedSink};
pub use session::{
    AssistConfig, AssistSessionManager, AssistState, LinkStatus, SessionPhase,
};
pub use transport::{EventTransport, WsConfig, WsTransport};
