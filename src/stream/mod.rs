//! Upstream audio source
//!
//! A `SourceConnector` turns a stream URL into a byte stream. `StreamAdapter`
//! owns the one open stream, pumps its chunks into a bounded frame channel for
//! the player, and reports read errors and end-of-stream to the relay loop
//! tagged with the cycle that opened it.
//!
//! Two connectors are provided:
//! - `ffmpeg`: spawn ffmpeg, read decoded s16le PCM from its stdout
//! - `http`: fetch the raw encoded stream, reconnecting a bounded number of times

pub mod ffmpeg;
pub mod http;

pub use ffmpeg::{ffmpeg_args, DecodeConfig, FfmpegConnector};
pub use http::{HttpConnector, RetryPolicy};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state_machine::Event;

/// Chunks buffered between the source and the player
const FRAME_BUFFER: usize = 64;

/// Encoding of the bytes a source produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", rename_all = "lowercase")]
pub enum AudioFormat {
    /// Raw signed 16-bit little-endian PCM
    S16le { sample_rate: u32, channels: u16 },
    /// Encoded container bytes, decoded by the voice transport
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ffmpeg,
    Http,
}

/// Errors that can occur while opening or reading the upstream stream
#[derive(Debug, Clone)]
pub enum StreamError {
    /// Decoder process could not be started
    Spawn(String),
    /// Reading from the source failed
    Io(String),
    /// HTTP request failed before a response arrived
    Http(String),
    /// Upstream answered with a non-success status
    Status(u16),
    /// Gave up reconnecting
    RetriesExhausted { attempts: u32, last: String },
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Spawn(e) => write!(f, "Failed to start decoder: {}", e),
            StreamError::Io(e) => write!(f, "Stream read failed: {}", e),
            StreamError::Http(e) => write!(f, "Stream request failed: {}", e),
            StreamError::Status(code) => write!(f, "Stream returned HTTP {}", code),
            StreamError::RetriesExhausted { attempts, last } => {
                write!(f, "Stream failed after {} reconnects: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for StreamError {}

pub type ByteSource = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// A connected source: what it produces and the bytes themselves.
pub struct SourceStream {
    pub format: AudioFormat,
    pub bytes: ByteSource,
}

#[async_trait]
pub trait SourceConnector: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;
    async fn connect(&self, url: &str) -> Result<SourceStream, StreamError>;
}

/// Describes the open stream, for `debug`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamInfo {
    pub cycle: Uuid,
    pub url: String,
    pub transport: TransportKind,
    pub format: AudioFormat,
    pub opened_at: DateTime<Utc>,
}

/// What the player consumes.
pub struct OpenedStream {
    pub format: AudioFormat,
    pub frames: mpsc::Receiver<Bytes>,
}

struct StreamHandle {
    info: StreamInfo,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

pub struct StreamAdapter {
    connector: Arc<dyn SourceConnector>,
    events: mpsc::Sender<Event>,
    current: Mutex<Option<StreamHandle>>,
}

impl StreamAdapter {
    pub fn new(connector: Arc<dyn SourceConnector>, events: mpsc::Sender<Event>) -> Self {
        Self {
            connector,
            events,
            current: Mutex::new(None),
        }
    }

    /// Open `url` for restart cycle `cycle`, closing any previously open stream.
    pub async fn open(&self, url: &str, cycle: Uuid) -> Result<OpenedStream, StreamError> {
        self.close().await;

        let transport = self.connector.kind();
        log::info!("Opening {:?} stream {} (cycle {})", transport, url, cycle);
        let source = self.connector.connect(url).await?;

        let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
        let cancel = CancellationToken::new();
        let pump = tokio::spawn(pump_source(
            source.bytes,
            frames_tx,
            cycle,
            cancel.clone(),
            self.events.clone(),
        ));

        let handle = StreamHandle {
            info: StreamInfo {
                cycle,
                url: url.to_string(),
                transport,
                format: source.format,
                opened_at: Utc::now(),
            },
            cancel,
            pump,
        };
        if let Some(previous) = self.current.lock().await.replace(handle) {
            log::warn!("Replacing stream from cycle {}", previous.info.cycle);
            previous.cancel.cancel();
            previous.pump.abort();
        }

        Ok(OpenedStream {
            format: source.format,
            frames: frames_rx,
        })
    }

    /// Close the open stream, if any. Closing an already closed adapter is a no-op.
    pub async fn close(&self) {
        let previous = self.current.lock().await.take();
        if let Some(handle) = previous {
            log::info!("Closing stream {} (cycle {})", handle.info.url, handle.info.cycle);
            handle.cancel.cancel();
            handle.pump.abort();
        }
    }

    pub async fn info(&self) -> Option<StreamInfo> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|handle| handle.info.clone())
    }
}

async fn pump_source(
    mut bytes: ByteSource,
    frames: mpsc::Sender<Bytes>,
    cycle: Uuid,
    cancel: CancellationToken,
    events: mpsc::Sender<Event>,
) {
    loop {
        let item = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                log::debug!("Stream pump cancelled (cycle {})", cycle);
                return;
            }

            item = bytes.next() => item,
        };

        match item {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if frames.send(chunk).await.is_err() {
                    log::debug!("Player dropped its frame receiver (cycle {})", cycle);
                    return;
                }
            }
            Some(Err(err)) => {
                log::warn!("Stream error (cycle {}): {}", cycle, err);
                let _ = events
                    .send(Event::StreamFailed {
                        cycle,
                        err: err.to_string(),
                    })
                    .await;
                return;
            }
            None => {
                log::warn!("Stream ended (cycle {})", cycle);
                let _ = events.send(Event::StreamEnded { cycle }).await;
                return;
            }
        }
    }
}
