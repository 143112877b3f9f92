//! Assistant session lifecycle: connect, heartbeat, idle timeout,
//! backpressured audio ingestion, and inbound event dispatch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voicegate_audio::capture::AudioFrame;
use voicegate_audio::pcm;

use crate::event::{ClientEvent, InferenceConfiguration, ServerEnvelope, ServerEvent};
use crate::player::PlaybackSink;
use crate::transport::EventTransport;
use crate::AssistError;

/// Session lifecycle phase. `Closed` is terminal for one session;
/// a later start opens a fresh session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Active,
    Ending,
    Closed,
}

/// Coarse link health surfaced to observers instead of raw error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}

/// Observable session state, published as a single latest value.
#[derive(Debug, Clone)]
pub struct AssistState {
    pub phase: SessionPhase,
    pub link: LinkStatus,
    pub session_id: Option<String>,
    pub status_message: String,
    pub listening: bool,
    pub speaking: bool,
    pub vu_level: f32,
}

impl AssistState {
    fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            link: LinkStatus::Disconnected,
            session_id: None,
            status_message: String::new(),
            listening: false,
            speaking: false,
            vu_level: 0.0,
        }
    }
}

/// Tunables for [`AssistSessionManager`].
#[derive(Debug, Clone)]
pub struct AssistConfig {
    pub system_prompt: String,
    pub inference: InferenceConfiguration,
    /// Keep-alive cadence; zero disables the heartbeat.
    pub heartbeat_interval: Duration,
    /// Idle cutoff since the last outbound payload; zero disables the
    /// monitor.
    pub idle_timeout: Duration,
    pub sample_rate_hz: u32,
    pub channels: u16,
    /// Capacity of the drop-oldest microphone frame queue.
    pub audio_queue_capacity: usize,
}

impl Default for AssistConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            inference: InferenceConfiguration::default(),
            heartbeat_interval: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(120),
            sample_rate_hz: 16_000,
            channels: 1,
            audio_queue_capacity: 6,
        }
    }
}

/// One microphone frame queued for the uplink pump.
#[derive(Debug, Clone)]
struct UplinkFrame {
    data: Vec<u8>,
    sample_rate_hz: u32,
    channels: u16,
}

struct SessionCtx {
    session_id: String,
    transport: Arc<dyn EventTransport>,
    player: Arc<dyn PlaybackSink>,
    state: Arc<watch::Sender<AssistState>>,
    cancel: CancellationToken,
    ended: AtomicBool,
    last_activity_ms: AtomicU64,
    playback_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    default_sample_rate_hz: u32,
    default_channels: u16,
}

impl SessionCtx {
    /// Sends one outbound envelope and stamps the activity clock.
    async fn send_event(&self, event: serde_json::Value) -> Result<(), AssistError> {
        self.transport.send(event).await?;
        self.last_activity_ms.store(now_ms(), Ordering::Release);
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut AssistState)) {
        self.state.send_modify(f);
    }
}

struct ActiveSession {
    ctx: Arc<SessionCtx>,
}

/// Owns at most one live assistant session.
///
/// Start requests while a session is active are no-ops. Stopping — or a
/// remote close, idle timeout, or fatal stream error — tears the session
/// down exactly once: the `sessionEnd` event goes out, timers and pumps
/// are cancelled, and the state transitions to [`SessionPhase::Closed`].
pub struct AssistSessionManager {
    config: AssistConfig,
    player: Arc<dyn PlaybackSink>,
    state: Arc<watch::Sender<AssistState>>,
    state_rx: watch::Receiver<AssistState>,
    active: AsyncMutex<Option<ActiveSession>>,
    /// Hot-path handle for the capture task; never blocks.
    uplink: std::sync::Mutex<Option<broadcast::Sender<UplinkFrame>>>,
}

impl AssistSessionManager {
    pub fn new(config: AssistConfig, player: Arc<dyn PlaybackSink>) -> Self {
        let (state, state_rx) = watch::channel(AssistState::idle());
        Self {
            config,
            player,
            state: Arc::new(state),
            state_rx,
            active: AsyncMutex::new(None),
            uplink: std::sync::Mutex::new(None),
        }
    }

    /// Observes the session state.
    pub fn state(&self) -> watch::Receiver<AssistState> {
        self.state_rx.clone()
    }

    /// Opens a session over `transport`. A start while a session is
    /// active is a no-op; no second session id is created.
    pub async fn start(&self, transport: Arc<dyn EventTransport>) -> Result<(), AssistError> {
        let mut active = self.active.lock().await;
        if active
            .as_ref()
            .is_some_and(|s| !s.ctx.ended.load(Ordering::Acquire))
        {
            debug!("assistant session already active; ignoring start request");
            return Ok(());
        }

        let session_id = Uuid::new_v4().to_string();
        self.state.send_modify(|s| {
            *s = AssistState::idle();
            s.phase = SessionPhase::Connecting;
            s.link = LinkStatus::Connecting;
            s.session_id = Some(session_id.clone());
            s.status_message = "connecting".into();
            s.listening = true;
        });

        let start_event = ClientEvent::session_start(
            &session_id,
            &self.config.system_prompt,
            self.config.inference.clone(),
        )
        .to_value()?;

        if let Err(e) = transport.send(start_event).await {
            error!("failed to open assistant session: {e}");
            self.state.send_modify(|s| {
                *s = AssistState::idle();
                s.status_message = format!("connection failed: {e}");
            });
            return Err(e);
        }

        let ctx = Arc::new(SessionCtx {
            session_id: session_id.clone(),
            transport,
            player: self.player.clone(),
            state: self.state.clone(),
            cancel: CancellationToken::new(),
            ended: AtomicBool::new(false),
            last_activity_ms: AtomicU64::new(now_ms()),
            playback_task: std::sync::Mutex::new(None),
            default_sample_rate_hz: self.config.sample_rate_hz,
            default_channels: self.config.channels,
        });

        ctx.update(|s| {
            s.phase = SessionPhase::Active;
            s.link = LinkStatus::Connected;
            s.status_message = "session established".into();
        });
        info!("assistant session {session_id} established");

        let (audio_tx, audio_rx) = broadcast::channel(self.config.audio_queue_capacity.max(1));
        tokio::spawn(uplink_pump(ctx.clone(), audio_rx));
        tokio::spawn(read_pump(ctx.clone()));
        if !self.config.heartbeat_interval.is_zero() {
            tokio::spawn(heartbeat_loop(ctx.clone(), self.config.heartbeat_interval));
        }
        if !self.config.idle_timeout.is_zero() {
            tokio::spawn(idle_monitor(ctx.clone(), self.config.idle_timeout));
        }

        *self.uplink.lock().unwrap() = Some(audio_tx);
        *active = Some(ActiveSession { ctx });
        Ok(())
    }

    /// Ends the session, if any. Safe to call multiple times.
    pub async fn stop(&self, reason: Option<&str>) {
        let session = self.active.lock().await.take();
        *self.uplink.lock().unwrap() = None;
        if let Some(session) = session {
            end_session(&session.ctx, reason).await;
        }
    }

    /// Ingests one microphone frame. Never blocks: frames enter a
    /// bounded drop-oldest queue, and overflow degrades the link status
    /// instead of stalling capture. A no-op without an active session.
    pub fn on_audio_frame(&self, data: &[u8], sample_rate_hz: u32, channels: u16) {
        let Some(audio_tx) = self.uplink.lock().unwrap().clone() else {
            return;
        };

        let vu_level = pcm::rms_bytes(data).clamp(0.0, 1.0);
        self.state.send_modify(|s| {
            s.vu_level = vu_level;
            s.listening = true;
        });

        let frame = UplinkFrame {
            data: data.to_vec(),
            sample_rate_hz: if sample_rate_hz > 0 {
                sample_rate_hz
            } else {
                self.config.sample_rate_hz
            },
            channels: if channels > 0 {
                channels
            } else {
                self.config.channels
            },
        };
        // Fails only when the pump is gone, i.e. the session ended.
        let _ = audio_tx.send(frame);
    }

    /// Bridges a capture-engine frame subscription into the session.
    pub fn spawn_ingest(
        self: &Arc<Self>,
        mut frames: mpsc::Receiver<AudioFrame>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let bytes = pcm::samples_to_bytes(&frame.samples);
                manager.on_audio_frame(&bytes, 0, 0);
            }
        })
    }
}

/// Serializes queued frames to the endpoint in order. Queue overflow is
/// observed here as a lagged receiver and surfaces as a degraded link.
async fn uplink_pump(ctx: Arc<SessionCtx>, mut audio_rx: broadcast::Receiver<UplinkFrame>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            result = audio_rx.recv() => match result {
                Ok(frame) => {
                    let event = ClientEvent::audio_input(
                        &ctx.session_id,
                        &frame.data,
                        frame.sample_rate_hz,
                        frame.channels,
                    )
                    .to_value();
                    let event = match event {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("failed to encode audio frame: {e}");
                            continue;
                        }
                    };
                    match ctx.send_event(event).await {
                        Ok(()) => ctx.update(|s| {
                            if s.link == LinkStatus::Degraded {
                                s.link = LinkStatus::Connected;
                            }
                        }),
                        Err(e) => {
                            error!("failed to stream audio to assistant: {e}");
                            end_session(&ctx, Some("error")).await;
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("assistant audio queue overflowed; dropped {skipped} frames");
                    ctx.update(|s| s.link = LinkStatus::Degraded);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Demultiplexes inbound events until the stream ends.
async fn read_pump(ctx: Arc<SessionCtx>) {
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            message = ctx.transport.recv() => match message {
                Some(Ok(value)) => dispatch_server_event(&ctx, value),
                Some(Err(e)) => {
                    error!("assistant stream error: {e}");
                    end_session(&ctx, Some("error")).await;
                    break;
                }
                None => {
                    info!("assistant session closed by remote");
                    end_session(&ctx, Some("remote_end")).await;
                    break;
                }
            },
        }
    }
}

fn dispatch_server_event(ctx: &Arc<SessionCtx>, value: serde_json::Value) {
    let envelope: ServerEnvelope = match serde_json::from_value(value) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("failed to parse assistant event payload: {e}");
            return;
        }
    };
    let Some(event) = envelope.event else {
        return;
    };
    handle_event(ctx, event);
}

fn handle_event(ctx: &Arc<SessionCtx>, event: ServerEvent) {
    if let Some(text) = event.text_output {
        if !text.content.is_empty() {
            ctx.update(|s| s.status_message = text.content);
        }
    }

    if let Some(audio) = event.audio_output {
        use base64::Engine;
        match base64::engine::general_purpose::STANDARD.decode(&audio.content) {
            Ok(bytes) if !bytes.is_empty() => {
                let format = audio.audio_format.unwrap_or_default();
                let sample_rate = format
                    .sample_rate_hz
                    .filter(|&r| r > 0)
                    .unwrap_or(ctx.default_sample_rate_hz);
                let channels = format
                    .channels
                    .filter(|&c| c > 0)
                    .unwrap_or(ctx.default_channels);

                ctx.update(|s| s.speaking = true);
                let playback_ctx = ctx.clone();
                let task = tokio::spawn(async move {
                    playback_ctx.player.play(&bytes, sample_rate, channels).await;
                    playback_ctx.update(|s| s.speaking = false);
                });
                // A new utterance supersedes any in-flight playback.
                if let Some(previous) = ctx.playback_task.lock().unwrap().replace(task) {
                    previous.abort();
                }
            }
            Ok(_) => {}
            Err(e) => warn!("failed to decode assistant audio output: {e}"),
        }
    }

    if event.content_end.is_some() {
        ctx.update(|s| s.speaking = false);
    }
}

async fn heartbeat_loop(ctx: Arc<SessionCtx>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let event = match ClientEvent::heartbeat(&ctx.session_id).to_value() {
                    Ok(v) => v,
                    Err(e) => {
                        warn!("failed to encode heartbeat: {e}");
                        continue;
                    }
                };
                if let Err(e) = ctx.send_event(event).await {
                    error!("heartbeat send failed: {e}");
                    end_session(&ctx, Some("error")).await;
                    break;
                }
            }
        }
    }
}

/// Checks at half the timeout cadence; ends the session once idle time
/// since the last outbound payload reaches the configured timeout.
async fn idle_monitor(ctx: Arc<SessionCtx>, timeout: Duration) {
    let cadence = (timeout / 2).max(Duration::from_secs(1)).min(timeout);
    let mut ticker = interval_at(Instant::now() + timeout, cadence);
    loop {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                if ctx.ended.load(Ordering::Acquire) {
                    break;
                }
                let idle_ms = now_ms().saturating_sub(ctx.last_activity_ms.load(Ordering::Acquire));
                if idle_ms >= timeout.as_millis() as u64 {
                    warn!(
                        "assistant session {} idle for {idle_ms} ms, ending",
                        ctx.session_id
                    );
                    end_session(&ctx, Some("timeout")).await;
                    break;
                }
            }
        }
    }
}

/// Tears the session down exactly once: the end-of-session event goes
/// out first, then the stream closes, tasks cancel, and the closed state
/// publishes, regardless of whether closure was local, remote, or
/// error-driven.
async fn end_session(ctx: &Arc<SessionCtx>, reason: Option<&str>) {
    if ctx.ended.swap(true, Ordering::AcqRel) {
        return;
    }

    ctx.update(|s| s.phase = SessionPhase::Ending);
    if let Ok(event) = ClientEvent::session_end(&ctx.session_id, reason).to_value() {
        if let Err(e) = ctx.transport.send(event).await {
            debug!("failed to send session end: {e}");
        }
    }
    ctx.transport.close().await;
    ctx.cancel.cancel();
    if let Some(task) = ctx.playback_task.lock().unwrap().take() {
        task.abort();
    }

    let message = match reason {
        Some(reason) => format!("session closed: {reason}"),
        None => "session closed".into(),
    };
    ctx.update(move |s| {
        *s = AssistState::idle();
        s.phase = SessionPhase::Closed;
        s.status_message = message;
    });
    info!(
        "assistant session {} closed ({})",
        ctx.session_id,
        reason.unwrap_or("local")
    );
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::{NullSink, TimedSink};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Transport double: records outbound events, replays scripted
    /// inbound events, optionally delays each send.
    struct MockTransport {
        sent: Mutex<Vec<serde_json::Value>>,
        inbound: AsyncMutex<mpsc::Receiver<Result<serde_json::Value, AssistError>>>,
        send_delay: Duration,
        fail_sends: AtomicBool,
    }

    impl MockTransport {
        fn channel(
            send_delay: Duration,
        ) -> (
            Arc<Self>,
            mpsc::Sender<Result<serde_json::Value, AssistError>>,
        ) {
            let (tx, rx) = mpsc::channel(16);
            (
                Arc::new(Self {
                    sent: Mutex::new(Vec::new()),
                    inbound: AsyncMutex::new(rx),
                    send_delay,
                    fail_sends: AtomicBool::new(false),
                }),
                tx,
            )
        }

        fn sent_of_kind(&self, kind: &str) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|v| v["event"].get(kind).is_some())
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl EventTransport for MockTransport {
        async fn send(&self, event: serde_json::Value) -> Result<(), AssistError> {
            if self.fail_sends.load(Ordering::Acquire) {
                return Err(AssistError::SessionClosed);
            }
            if !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }

        async fn recv(&self) -> Option<Result<serde_json::Value, AssistError>> {
            self.inbound.lock().await.recv().await
        }

        async fn close(&self) {}
    }

    fn quick_config() -> AssistConfig {
        AssistConfig {
            heartbeat_interval: Duration::ZERO,
            idle_timeout: Duration::ZERO,
            ..AssistConfig::default()
        }
    }

    fn manager(config: AssistConfig) -> Arc<AssistSessionManager> {
        Arc::new(AssistSessionManager::new(config, Arc::new(NullSink)))
    }

    #[tokio::test]
    async fn start_while_active_is_a_no_op() {
        let manager = manager(quick_config());
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);

        manager.start(transport.clone()).await.unwrap();
        let first_id = manager.state().borrow().session_id.clone();
        manager.start(transport.clone()).await.unwrap();

        assert_eq!(transport.sent_of_kind("sessionStart").len(), 1);
        assert_eq!(manager.state().borrow().session_id, first_id);
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn frames_flow_through_the_pump_in_order() {
        let manager = manager(quick_config());
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        for i in 0..3u8 {
            manager.on_audio_frame(&[i, 0, i, 0], 16_000, 1);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        use base64::Engine;
        let inputs = transport.sent_of_kind("audioInput");
        assert_eq!(inputs.len(), 3);
        for (i, event) in inputs.iter().enumerate() {
            let content = event["event"]["audioInput"]["audio"]["content"]
                .as_str()
                .unwrap();
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(content)
                .unwrap();
            assert_eq!(decoded[0], i as u8);
        }
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_degrades_link() {
        let config = AssistConfig {
            audio_queue_capacity: 2,
            ..quick_config()
        };
        let manager = manager(config);
        // Slow sends keep the pump busy so the queue overflows.
        let (transport, _inbound) = MockTransport::channel(Duration::from_millis(20));
        manager.start(transport.clone()).await.unwrap();

        for i in 0..10u8 {
            manager.on_audio_frame(&[i, 0], 16_000, 1);
        }

        let mut state = manager.state();
        let degraded = tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                if state.borrow().link == LinkStatus::Degraded {
                    break;
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(degraded.is_ok(), "link never degraded under overflow");

        tokio::time::sleep(Duration::from_millis(300)).await;
        let forwarded = transport.sent_of_kind("audioInput").len();
        assert!(forwarded < 10, "overflow should drop frames, sent {forwarded}");
        // The pump recovered after draining.
        assert_eq!(manager.state().borrow().link, LinkStatus::Connected);
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn idle_timeout_closes_with_reason() {
        let config = AssistConfig {
            idle_timeout: Duration::from_millis(80),
            ..quick_config()
        };
        let manager = manager(config);
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        let mut state = manager.state();
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if state.borrow().phase == SessionPhase::Closed {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("session did not time out");

        let snapshot = manager.state().borrow().clone();
        assert!(snapshot.status_message.contains("timeout"));
        let ends = transport.sent_of_kind("sessionEnd");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0]["event"]["sessionEnd"]["reason"], "timeout");
    }

    #[tokio::test]
    async fn heartbeats_keep_flowing() {
        let config = AssistConfig {
            heartbeat_interval: Duration::from_millis(25),
            ..quick_config()
        };
        let manager = manager(config);
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(transport.sent_of_kind("sessionHeartbeat").len() >= 2);
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn heartbeat_traffic_defers_idle_timeout() {
        let config = AssistConfig {
            heartbeat_interval: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(100),
            ..quick_config()
        };
        let manager = manager(config);
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(manager.state().borrow().phase, SessionPhase::Active);
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn closed_notification_fires_exactly_once_under_races() {
        let manager = manager(quick_config());
        let (transport, inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        // Remote close and local stop race each other.
        drop(inbound);
        manager.stop(Some("shutdown")).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(transport.sent_of_kind("sessionEnd").len(), 1);
        assert_eq!(manager.state().borrow().phase, SessionPhase::Closed);

        // Stop after close is a no-op.
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn remote_close_ends_the_session() {
        let manager = manager(quick_config());
        let (transport, inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        drop(inbound);
        let mut state = manager.state();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if state.borrow().phase == SessionPhase::Closed {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("remote close did not end session");
        assert!(manager
            .state()
            .borrow()
            .status_message
            .contains("remote_end"));
    }

    #[tokio::test]
    async fn text_output_updates_status_message() {
        let manager = manager(quick_config());
        let (transport, inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        inbound
            .send(Ok(serde_json::json!({
                "event": {"textOutput": {"content": "uplink nominal"}}
            })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.state().borrow().status_message, "uplink nominal");
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn audio_output_paces_speaking_flag() {
        use base64::Engine;
        let manager = Arc::new(AssistSessionManager::new(quick_config(), Arc::new(TimedSink)));
        let (transport, inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        // 100ms of 16kHz mono PCM.
        let pcm = vec![0u8; 3_200];
        let content = base64::engine::general_purpose::STANDARD.encode(&pcm);
        inbound
            .send(Ok(serde_json::json!({
                "event": {"audioOutput": {
                    "content": content,
                    "audioFormat": {"sampleRateHz": 16_000, "channels": 1}
                }}
            })))
            .await
            .unwrap();

        let mut state = manager.state();
        tokio::time::timeout(Duration::from_millis(200), async {
            loop {
                if state.borrow().speaking {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("speaking flag never set");

        tokio::time::timeout(Duration::from_millis(500), async {
            loop {
                if !state.borrow().speaking {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("speaking flag never cleared after playback");
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn content_end_clears_speaking() {
        let manager = manager(quick_config());
        let (transport, inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        inbound
            .send(Ok(serde_json::json!({"event": {"contentEnd": {}}})))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!manager.state().borrow().speaking);
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn send_failure_closes_with_error_reason() {
        let manager = manager(quick_config());
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        transport.fail_sends.store(true, Ordering::Release);
        manager.on_audio_frame(&[1, 0], 16_000, 1);

        let mut state = manager.state();
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if state.borrow().phase == SessionPhase::Closed {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("send failure did not close session");
        assert!(manager.state().borrow().status_message.contains("error"));
    }

    #[tokio::test]
    async fn ingest_bridges_capture_frames() {
        let manager = manager(quick_config());
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();

        let (tx, rx) = mpsc::channel(8);
        let ingest = manager.spawn_ingest(rx);
        tx.send(AudioFrame {
            samples: vec![100i16; 160],
            timestamp_ms: 1,
        })
        .await
        .unwrap();
        drop(tx);
        ingest.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(transport.sent_of_kind("audioInput").len(), 1);
        assert!(manager.state().borrow().vu_level > 0.0);
        manager.stop(None).await;
    }

    #[tokio::test]
    async fn restart_after_close_opens_a_new_session() {
        let manager = manager(quick_config());
        let (transport, _inbound) = MockTransport::channel(Duration::ZERO);
        manager.start(transport.clone()).await.unwrap();
        let first = manager.state().borrow().session_id.clone().unwrap();
        manager.stop(None).await;

        let (transport2, _inbound2) = MockTransport::channel(Duration::ZERO);
        manager.start(transport2.clone()).await.unwrap();
        let second = manager.state().borrow().session_id.clone().unwrap();
        assert_ne!(first, second);
        manager.stop(None).await;
    }
}
