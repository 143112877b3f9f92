//! Contract for the external streaming-transcription service.
//!
//! The wire protocol is owned by the cloud service; this crate only
//! depends on "open a session, push PCM chunks, receive transcript
//! segments, learn when the session closes".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{Transcript, TranscribeError};

/// Channel depth between the forwarder and a session's uplink.
const SESSION_DEPTH: usize = 32;

/// Channel depth per transcript subscriber.
const TRANSCRIPT_DEPTH: usize = 32;

/// Opens streaming transcription sessions against the cloud service and
/// surfaces the transcript segments they produce.
#[async_trait]
pub trait TranscribeService: Send + Sync {
    async fn start_session(&self) -> Result<SessionHandle, TranscribeError>;

    /// Subscribes to transcript segments across all sessions. Segments
    /// arrive as copies over a bounded channel; a slow subscriber loses
    /// segments rather than stalling the service.
    fn transcripts(&self) -> mpsc::Receiver<Transcript>;
}

/// Uplink of one streaming session.
///
/// Sends prefer the non-blocking path; the async [`send`](Self::send)
/// is the backpressure fallback. Dropping the handle closes the uplink.
pub struct SessionHandle {
    session_id: String,
    audio_tx: mpsc::Sender<Vec<u8>>,
}

impl SessionHandle {
    pub fn new(session_id: impl Into<String>, audio_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            session_id: session_id.into(),
            audio_tx,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Non-blocking send. On failure the payload is handed back so the
    /// caller can retry through [`send`](Self::send).
    pub fn try_send(&self, bytes: Vec<u8>) -> Result<(), Vec<u8>> {
        self.audio_tx.try_send(bytes).map_err(|e| e.into_inner())
    }

    /// Blocking send; waits for uplink capacity.
    pub async fn send(&self, bytes: Vec<u8>) -> Result<(), TranscribeError> {
        self.audio_tx
            .send(bytes)
            .await
            .map_err(|_| TranscribeError::SessionClosed(self.session_id.clone()))
    }

    /// Whether the remote side has torn the session down.
    pub fn is_closed(&self) -> bool {
        self.audio_tx.is_closed()
    }
}

/// In-process [`TranscribeService`] that records every forwarded payload
/// and acknowledges each one with a final transcript segment. Backs
/// tests and the offline pipeline check.
pub struct CollectorService {
    capacity: usize,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    sessions_started: Arc<Mutex<u32>>,
    transcript_subs: Arc<Mutex<Vec<mpsc::Sender<Transcript>>>>,
    sequence: Arc<AtomicU64>,
}

impl CollectorService {
    pub fn new() -> Self {
        Self::with_capacity(SESSION_DEPTH)
    }

    /// Uses a custom uplink depth; small depths exercise backpressure.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            received: Arc::new(Mutex::new(Vec::new())),
            sessions_started: Arc::new(Mutex::new(0)),
            transcript_subs: Arc::new(Mutex::new(Vec::new())),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Payloads received so far, across all sessions.
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }

    pub fn session_count(&self) -> u32 {
        *self.sessions_started.lock().unwrap()
    }
}

impl Default for CollectorService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranscribeService for CollectorService {
    async fn start_session(&self) -> Result<SessionHandle, TranscribeError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::channel(self.capacity);
        let received = self.received.clone();
        let transcript_subs = self.transcript_subs.clone();
        let sequence = self.sequence.clone();
        *self.sessions_started.lock().unwrap() += 1;

        let id = session_id.clone();
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                let transcript = Transcript {
                    session_id: id.clone(),
                    text: format!("{} bytes received", bytes.len()),
                    is_partial: false,
                    start_time_s: None,
                    end_time_s: None,
                    result_id: None,
                    items: Vec::new(),
                    sequence: sequence.fetch_add(1, Ordering::Relaxed),
                    received_at_ms: now_ms(),
                };
                received.lock().unwrap().push(bytes);

                let mut subs = transcript_subs.lock().unwrap();
                subs.retain(|sub| !sub.is_closed());
                for sub in subs.iter() {
                    if sub.try_send(transcript.clone()).is_err() {
                        debug!("transcript subscriber is saturated; dropping segment");
                    }
                }
            }
            debug!("collector session {id} drained");
        });

        Ok(SessionHandle::new(session_id, tx))
    }

    fn transcripts(&self) -> mpsc::Receiver<Transcript> {
        let (tx, rx) = mpsc::channel(TRANSCRIPT_DEPTH);
        self.transcript_subs.lock().unwrap().push(tx);
        rx
    }
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

    #[tokio::test]
    async fn collector_records_sent_payloads() {
        let service = CollectorService::new();
        let handle = service.start_session().await.unwrap();
        assert!(!handle.is_closed());

        handle.try_send(vec![1, 2, 3]).unwrap();
        handle.send(vec![4, 5]).await.unwrap();
        tokio::task::yield_now().await;

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(service.received(), vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn transcripts_surface_per_forwarded_payload() {
        let service = CollectorService::new();
        let mut transcripts = service.transcripts();
        let handle = service.start_session().await.unwrap();

        handle.send(vec![0u8; 640]).await.unwrap();
        handle.send(vec![0u8; 320]).await.unwrap();

        let first = transcripts.recv().await.unwrap();
        assert_eq!(first.session_id, handle.session_id());
        assert_eq!(first.text, "640 bytes received");
        assert!(!first.is_partial);
        assert!(first.received_at_ms > 0);

        let second = transcripts.recv().await.unwrap();
        assert_eq!(second.text, "320 bytes received");
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn late_subscriber_sees_only_new_transcripts() {
        let service = CollectorService::new();
        let handle = service.start_session().await.unwrap();
        handle.send(vec![1u8; 10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut transcripts = service.transcripts();
        handle.send(vec![2u8; 20]).await.unwrap();
        let segment = transcripts.recv().await.unwrap();
        assert_eq!(segment.text, "20 bytes received");
    }

    #[tokio::test]
    async fn try_send_returns_payload_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SessionHandle::new("s", tx);
        handle.try_send(vec![1]).unwrap();
        let rejected = handle.try_send(vec![2]).unwrap_err();
        assert_eq!(rejected, vec![2]);
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let (tx, rx) = mpsc::channel(1);
        let handle = SessionHandle::new("s", tx);
        drop(rx);
        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(vec![1]).await,
            Err(TranscribeError::SessionClosed(_))
        ));
    }
}
