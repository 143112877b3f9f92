//! Event transport toward the conversational endpoint.
//!
//! The session layer only depends on [`EventTransport`]; the WebSocket
//! implementation runs dedicated read and write loops so sends never
//! contend with receives.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::AssistError;

/// Bidirectional JSON event stream.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Sends one event envelope.
    async fn send(&self, event: serde_json::Value) -> Result<(), AssistError>;

    /// Receives the next inbound envelope. `None` means the remote side
    /// closed the stream.
    async fn recv(&self) -> Option<Result<serde_json::Value, AssistError>>;

    /// Closes the outbound side of the stream. Idempotent.
    async fn close(&self);
}

/// WebSocket endpoint configuration.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub bearer_token: Option<String>,
}

/// WebSocket-backed [`EventTransport`].
pub struct WsTransport {
    write_tx: mpsc::Sender<Message>,
    event_rx: Mutex<mpsc::Receiver<Result<serde_json::Value, AssistError>>>,
    _read_handle: tokio::task::JoinHandle<()>,
    _write_handle: tokio::task::JoinHandle<()>,
}

impl WsTransport {
    /// Connects to the endpoint and spawns the read/write loops.
    pub async fn connect(config: &WsConfig) -> Result<Self, AssistError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| AssistError::Connection(format!("failed to build request: {e}")))?;

        if let Some(ref token) = config.bearer_token {
            let value = format!("Bearer {token}")
                .parse::<http::HeaderValue>()
                .map_err(|e| AssistError::Connection(format!("invalid bearer token: {e}")))?;
            request.headers_mut().insert("Authorization", value);
        }

        debug!("connecting to {}", config.url);
        let (ws_stream, _response) = connect_async(request).await?;
        let (write, read) = ws_stream.split();

        let (event_tx, event_rx) = mpsc::channel(100);
        let (write_tx, write_rx) = mpsc::channel(100);

        let write_handle = tokio::spawn(write_loop(write, write_rx));
        let read_handle = tokio::spawn(read_loop(read, event_tx));

        Ok(Self {
            write_tx,
            event_rx: Mutex::new(event_rx),
            _read_handle: read_handle,
            _write_handle: write_handle,
        })
    }
}

#[async_trait]
impl EventTransport for WsTransport {
    async fn send(&self, event: serde_json::Value) -> Result<(), AssistError> {
        let text = event.to_string();
        debug!("sending event: {}", truncate_for_log(&text, 500));
        self.write_tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| AssistError::SessionClosed)
    }

    async fn recv(&self) -> Option<Result<serde_json::Value, AssistError>> {
        self.event_rx.lock().await.recv().await
    }

    async fn close(&self) {
        let _ = self.write_tx.send(Message::Close(None)).await;
    }
}

type WsSink = futures::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    Message,
>;

type WsSource = futures::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;

async fn write_loop(mut write: WsSink, mut rx: mpsc::Receiver<Message>) {
    while let Some(msg) = rx.recv().await {
        if let Message::Close(_) = msg {
            let _ = write.close().await;
            break;
        }
        if let Err(e) = write.send(msg).await {
            error!("write error: {e}");
            break;
        }
    }
}

async fn read_loop(mut read: WsSource, tx: mpsc::Sender<Result<serde_json::Value, AssistError>>) {
    while let Some(result) = read.next().await {
        match result {
            Ok(Message::Text(text)) => {
                debug!("received: {}", truncate_for_log(text.as_str(), 1000));
                let parsed = serde_json::from_str(text.as_str()).map_err(AssistError::Json);
                if tx.send(parsed).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                debug!("stream closed by server");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(_) => {}
            Err(e) => {
                error!("read error: {e}");
                let _ = tx.send(Err(AssistError::WebSocket(e))).await;
                break;
            }
        }
    }
}

fn truncate_for_log(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    // Back off to a char boundary so multi-byte text never panics.
    let mut cut = max_len;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &s[..cut])
}
