//! Speaker-gated forwarding of audio windows into a transcription
//! session.

use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

use voicegate_audio::pcm;
use voicegate_audio::window::AudioWindow;
use voicegate_voiceprint::{VerificationState, VerificationStatus};

use crate::service::{SessionHandle, TranscribeService};

/// Lifecycle of the streaming toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingState {
    Disabled,
    Starting,
    Active,
    Stopping,
}

/// Tunables for [`TranscriptionForwarder`].
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Window RMS below this is treated as ambient sound and forwarded
    /// unmodified.
    pub vad_rms_threshold: f32,
    /// Whether `Unknown` verification redacts like `Mismatch`.
    pub redact_unknown: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            vad_rms_threshold: 0.012,
            redact_unknown: true,
        }
    }
}

struct Inner {
    state: StreamingState,
    handle: Option<Arc<SessionHandle>>,
}

/// Gates each window by voice activity and verification state, then
/// streams the result to the transcription service.
///
/// Redaction zero-fills the window rather than dropping it, preserving
/// the timing and continuity of the stream. The send path is
/// non-blocking first; under backpressure a window is delayed through an
/// async send, never silently dropped.
pub struct TranscriptionForwarder {
    service: Arc<dyn TranscribeService>,
    verification: watch::Receiver<VerificationState>,
    config: ForwarderConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<StreamingState>,
    state_rx: watch::Receiver<StreamingState>,
}

impl TranscriptionForwarder {
    pub fn new(
        service: Arc<dyn TranscribeService>,
        verification: watch::Receiver<VerificationState>,
        config: ForwarderConfig,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(StreamingState::Disabled);
        Self {
            service,
            verification,
            config,
            inner: Mutex::new(Inner {
                state: StreamingState::Disabled,
                handle: None,
            }),
            state_tx,
            state_rx,
        }
    }

    /// Observes the streaming toggle lifecycle.
    pub fn state(&self) -> watch::Receiver<StreamingState> {
        self.state_rx.clone()
    }

    /// Enables or disables streaming. Enabling acquires a fresh session
    /// from the service; disabling tears the current one down. Two
    /// sessions never run concurrently for the toggle.
    pub async fn set_enabled(&self, enabled: bool) {
        let mut inner = self.inner.lock().await;
        if enabled {
            if inner.state != StreamingState::Disabled {
                debug!("transcription streaming already enabled; ignoring");
                return;
            }
            self.transition(&mut inner, StreamingState::Starting);
            match self.service.start_session().await {
                Ok(handle) => {
                    info!("started transcription session {}", handle.session_id());
                    inner.handle = Some(Arc::new(handle));
                    self.transition(&mut inner, StreamingState::Active);
                }
                Err(e) => {
                    error!("unable to start transcription session: {e}");
                    self.transition(&mut inner, StreamingState::Disabled);
                }
            }
        } else {
            if inner.state == StreamingState::Disabled {
                return;
            }
            self.transition(&mut inner, StreamingState::Stopping);
            if let Some(handle) = inner.handle.take() {
                debug!("closing transcription session {}", handle.session_id());
            }
            self.transition(&mut inner, StreamingState::Disabled);
        }
    }

    fn transition(&self, inner: &mut Inner, state: StreamingState) {
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// Applies the gating decision to one window, returning the payload
    /// to stream: the window itself, or an equal-length zero buffer.
    pub fn gate(&self, data: &[u8]) -> Vec<u8> {
        let rms = pcm::rms_bytes(data);
        if rms < self.config.vad_rms_threshold {
            // Ambient sound and silence pass through untouched.
            return data.to_vec();
        }

        let state = self.verification.borrow().clone();
        let forward = match state.status {
            VerificationStatus::Match => true,
            VerificationStatus::Unknown => !self.config.redact_unknown,
            VerificationStatus::Mismatch => false,
        };
        if forward {
            debug!(
                confidence = state.confidence,
                rms, "forwarding verified audio window"
            );
            data.to_vec()
        } else {
            debug!(
                status = %state.status,
                confidence = state.confidence,
                rms,
                "redacting audio window"
            );
            vec![0u8; data.len()]
        }
    }

    /// Gates and streams one window. No-op unless streaming is active.
    pub async fn handle_window(&self, window: &AudioWindow) {
        let handle = {
            let mut inner = self.inner.lock().await;
            match inner.handle.as_ref() {
                Some(h) if !h.is_closed() => h.clone(),
                Some(h) => {
                    warn!(
                        "transcription session {} closed by remote; tearing down",
                        h.session_id()
                    );
                    inner.handle = None;
                    self.transition(&mut inner, StreamingState::Disabled);
                    return;
                }
                None => return,
            }
        };

        let payload = self.gate(&window.data);
        if let Err(payload) = handle.try_send(payload) {
            // Uplink is saturated; fall back to a blocking send so the
            // window is delayed rather than lost.
            tokio::spawn(async move {
                if let Err(e) = handle.send(payload).await {
                    error!("failed to stream audio window: {e}");
                }
            });
        }
    }

    /// Consumes windows from the capture pipeline until the channel
    /// closes.
    pub fn spawn(self: Arc<Self>, mut windows: mpsc::Receiver<AudioWindow>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(window) = windows.recv().await {
                self.handle_window(&window).await;
            }
        })
    }
}
