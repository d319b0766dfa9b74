//! WebSocket client for the voice bridge sidecar
//!
//! Each `join` opens its own WebSocket. A reader task turns `state` messages into
//! watch updates; a writer task owns the sink so control messages and audio frames
//! can be queued from anywhere without locking.
//!
//! If the socket drops, the session reports `Disconnected`. It never reconnects on
//! its own; recovery belongs to the connection manager and the relay loop.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};

use super::protocol::{ClientMessage, ServerMessage};
use super::{ConnectivityState, Destination, VoiceError, VoiceGateway, VoiceSession};
use crate::stream::AudioFormat;

/// Connection timeout for the WebSocket handshake
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Queued outgoing messages (control + audio)
const OUTGOING_BUFFER: usize = 256;

/// Audio frames buffered between the player and the socket
const AUDIO_BUFFER: usize = 64;

/// Joins voice channels through the bridge at `url`.
pub struct BridgeGateway {
    url: String,
    token: Option<String>,
}

impl BridgeGateway {
    /// `token` is sent as a bearer token on the handshake when present.
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl VoiceGateway for BridgeGateway {
    async fn join(&self, destination: &Destination) -> Result<Arc<dyn VoiceSession>, VoiceError> {
        let session = BridgeSession::connect(&self.url, self.token.as_deref(), destination).await?;
        Ok(Arc::new(session))
    }
}

/// Handle to one joined channel on the bridge
pub struct BridgeSession {
    destination: Destination,
    state_tx: Arc<watch::Sender<ConnectivityState>>,
    outgoing: mpsc::Sender<Message>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    audio_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    /// Set by the first `destroy`; the bridge may already have reported `Destroyed`
    left: AtomicBool,
}

impl BridgeSession {
    async fn connect(
        url: &str,
        token: Option<&str>,
        destination: &Destination,
    ) -> Result<Self, VoiceError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?;

        if let Some(token) = token {
            request.headers_mut().insert(
                "Authorization",
                HeaderValue::from_str(&format!("Bearer {}", token))
                    .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?,
            );
        }

        log::info!("Connecting to voice bridge at {}", url);

        let (ws_stream, _response) = timeout(CONNECTION_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| VoiceError::ConnectionFailed("Connection timeout".to_string()))?
            .map_err(|e| VoiceError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (state_tx, _) = watch::channel(ConnectivityState::Signalling);
        let state_tx = Arc::new(state_tx);
        let (outgoing, mut outgoing_rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    log::warn!("Voice bridge write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
            log::debug!("Bridge writer task exiting");
        });

        let reader_state = Arc::clone(&state_tx);
        let reader_task = tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::State { state }) => {
                            log::debug!("Voice bridge state: {:?}", state);
                            reader_state.send_replace(state);
                        }
                        Ok(ServerMessage::Error { message }) => {
                            log::warn!("Voice bridge error: {}", message);
                        }
                        Ok(ServerMessage::Unknown) => {}
                        Err(e) => {
                            log::warn!("Failed to parse bridge message: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        log::info!("Voice bridge closed the connection");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Voice bridge socket error: {}", e);
                        break;
                    }
                    _ => {} // Ignore ping/pong/binary
                }
            }

            reader_state.send_if_modified(|state| {
                if *state == ConnectivityState::Destroyed {
                    false
                } else {
                    *state = ConnectivityState::Disconnected;
                    true
                }
            });
            log::debug!("Bridge reader task exiting");
        });

        let session = Self {
            destination: destination.clone(),
            state_tx,
            outgoing,
            reader_task,
            writer_task,
            audio_task: std::sync::Mutex::new(None),
            left: AtomicBool::new(false),
        };

        session
            .send_message(&ClientMessage::Join {
                guild_id: destination.guild_id.clone(),
                channel_id: destination.channel_id.clone(),
                self_deaf: true,
            })
            .await?;

        Ok(session)
    }

    async fn send_message(&self, msg: &ClientMessage) -> Result<(), VoiceError> {
        let json = serde_json::to_string(msg).map_err(|e| VoiceError::Protocol(e.to_string()))?;
        self.outgoing
            .send(Message::Text(json))
            .await
            .map_err(|_| VoiceError::Closed)
    }

    /// Returns whether an audio output was bound before.
    fn replace_audio_task(&self, task: Option<JoinHandle<()>>) -> bool {
        let mut slot = self
            .audio_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match std::mem::replace(&mut *slot, task) {
            Some(previous) => {
                previous.abort();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl VoiceSession for BridgeSession {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    async fn audio_output(&self, format: AudioFormat) -> Result<mpsc::Sender<Bytes>, VoiceError> {
        self.send_message(&ClientMessage::Play { format }).await?;

        let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(AUDIO_BUFFER);
        let outgoing = self.outgoing.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if outgoing.send(Message::Binary(frame.to_vec())).await.is_err() {
                    log::debug!("Bridge socket gone, dropping audio output");
                    break;
                }
            }
        });
        self.replace_audio_task(Some(forwarder));

        log::info!("Audio output bound ({:?})", format);
        Ok(frames_tx)
    }

    async fn destroy(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_replace(ConnectivityState::Destroyed);

        let was_playing = self.replace_audio_task(None);
        let farewell = async {
            if was_playing {
                self.send_message(&ClientMessage::Stop).await?;
            }
            self.send_message(&ClientMessage::Leave).await
        };
        if farewell.await.is_ok() {
            let _ = self.outgoing.send(Message::Close(None)).await;
        }
        self.reader_task.abort();
        log::info!("Left voice channel {}", self.destination);
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        self.replace_audio_task(None);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}
