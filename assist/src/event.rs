//! JSON event envelopes exchanged with the conversational endpoint.
//!
//! Every outbound message is wrapped as `{"event": {"<name>": {...}}}`;
//! inbound messages carry the same shape with `textOutput`,
//! `audioOutput`, or `contentEnd` bodies.

use base64::Engine;
use serde::{Deserialize, Serialize};

/// Sampling parameters sent with `sessionStart`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceConfiguration {
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for InferenceConfiguration {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// PCM format descriptor attached to audio payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    #[serde(rename = "type")]
    pub kind: String,
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn pcm16(sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            kind: "pcm16".into(),
            sample_rate_hz,
            channels,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioPayload {
    pub audio_format: AudioFormat,
    /// Base64-encoded PCM bytes.
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub session_id: String,
    pub system_prompt: String,
    pub inference_configuration: InferenceConfiguration,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioInput {
    pub session_id: String,
    pub audio: AudioPayload,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnd {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Body of an outbound event envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientEventBody {
    SessionStart(SessionStart),
    AudioInput(AudioInput),
    SessionHeartbeat(SessionRef),
    SessionEnd(SessionEnd),
}

/// An outbound event envelope.
#[derive(Debug, Clone, Serialize)]
pub struct ClientEvent {
    pub event: ClientEventBody,
}

impl ClientEvent {
    pub fn session_start(
        session_id: &str,
        system_prompt: &str,
        inference: InferenceConfiguration,
    ) -> Self {
        Self {
            event: ClientEventBody::SessionStart(SessionStart {
                session_id: session_id.into(),
                system_prompt: system_prompt.into(),
                inference_configuration: inference,
            }),
        }
    }

    pub fn audio_input(session_id: &str, pcm: &[u8], sample_rate_hz: u32, channels: u16) -> Self {
        Self {
            event: ClientEventBody::AudioInput(AudioInput {
                session_id: session_id.into(),
                audio: AudioPayload {
                    audio_format: AudioFormat::pcm16(sample_rate_hz, channels),
                    content: base64::engine::general_purpose::STANDARD.encode(pcm),
                },
            }),
        }
    }

    pub fn heartbeat(session_id: &str) -> Self {
        Self {
            event: ClientEventBody::SessionHeartbeat(SessionRef {
                session_id: session_id.into(),
            }),
        }
    }

    pub fn session_end(session_id: &str, reason: Option<&str>) -> Self {
        Self {
            event: ClientEventBody::SessionEnd(SessionEnd {
                session_id: session_id.into(),
                reason: reason.map(str::to_string),
            }),
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// Inbound text body.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TextOutput {
    pub content: String,
}

/// Inbound audio body with base64 PCM and an optional format override.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioOutput {
    pub content: String,
    pub audio_format: Option<InboundAudioFormat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InboundAudioFormat {
    pub sample_rate_hz: Option<u32>,
    pub channels: Option<u16>,
}

/// Body of an inbound event; at most one field is set per message.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerEvent {
    pub text_output: Option<TextOutput>,
    pub audio_output: Option<AudioOutput>,
    pub content_end: Option<serde_json::Value>,
}

/// An inbound event envelope.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerEnvelope {
    pub event: Option<ServerEvent>,
}
