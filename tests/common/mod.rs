//! In-process fakes for the voice gateway, stream connector and metadata edges.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use relay_lib::connection::{
    ConnectivityState, Destination, VoiceError, VoiceGateway, VoiceSession,
};
use relay_lib::metadata::{LabelError, LabelSink, MetadataError, TrackInfo, TrackSource};
use relay_lib::settings::RelaySettings;
use relay_lib::stream::{AudioFormat, SourceConnector, SourceStream, StreamError, TransportKind};

/// Settings with delays short enough for tests.
pub fn fast_settings() -> RelaySettings {
    RelaySettings {
        stream_url: "http://radio.test/live".to_string(),
        guild_id: "guild".to_string(),
        channel_id: "voice".to_string(),
        restart_retry_delay_ms: 50,
        reacquire_timeout_ms: 100,
        ready_timeout_ms: 500,
        watchdog_interval_ms: 60_000,
        metadata_interval_ms: 60_000,
        ..Default::default()
    }
}

/// Poll `check` until it holds, panicking after five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub struct FakeSession {
    destination: Destination,
    state: watch::Sender<ConnectivityState>,
    pub destroyed: AtomicBool,
    pub frames: Arc<AtomicUsize>,
    pub formats: Mutex<Vec<AudioFormat>>,
}

impl FakeSession {
    pub fn set_state(&self, state: ConnectivityState) {
        self.state.send_replace(state);
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceSession for FakeSession {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }

    async fn audio_output(&self, format: AudioFormat) -> Result<mpsc::Sender<Bytes>, VoiceError> {
        self.formats.lock().unwrap().push(format);
        let (tx, mut rx) = mpsc::channel::<Bytes>(16);
        let frames = Arc::clone(&self.frames);
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                frames.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(tx)
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.state.send_replace(ConnectivityState::Destroyed);
    }
}

#[derive(Default)]
pub struct FakeGateway {
    joins: AtomicU32,
    /// Number of upcoming joins that fail
    pub fail_next: AtomicU32,
    /// Next join never completes
    pub hang_next: AtomicBool,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn joins(&self) -> u32 {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn latest(&self) -> Arc<FakeSession> {
        self.sessions
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no session joined yet")
    }

    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().unwrap().clone()
    }
}

#[async_trait]
impl VoiceGateway for FakeGateway {
    async fn join(&self, destination: &Destination) -> Result<Arc<dyn VoiceSession>, VoiceError> {
        self.joins.fetch_add(1, Ordering::SeqCst);

        if self.hang_next.swap(false, Ordering::SeqCst) {
            return std::future::pending().await;
        }

        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(VoiceError::ConnectionFailed("bridge unreachable".to_string()));
        }

        let (state, _) = watch::channel(ConnectivityState::Ready);
        let session = Arc::new(FakeSession {
            destination: destination.clone(),
            state,
            destroyed: AtomicBool::new(false),
            frames: Arc::new(AtomicUsize::new(0)),
            formats: Mutex::new(Vec::new()),
        });
        self.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

/// Each connect yields a stream the test controls; one frame is queued up front.
#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicU32,
    feeds: Mutex<Vec<mpsc::Sender<Result<Bytes, StreamError>>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// End the most recent stream cleanly.
    pub fn end_latest(&self) {
        self.feeds.lock().unwrap().pop();
    }

    /// Fail the most recent stream with a read error.
    pub fn fail_latest(&self) {
        if let Some(feed) = self.feeds.lock().unwrap().pop() {
            let _ = feed.try_send(Err(StreamError::Io("connection reset".to_string())));
        }
    }
}

#[async_trait]
impl SourceConnector for FakeConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Ffmpeg
    }

    async fn connect(&self, _url: &str) -> Result<SourceStream, StreamError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (feed, rx) = mpsc::channel(16);
        let _ = feed.try_send(Ok(Bytes::from_static(&[0u8; 64])));
        self.feeds.lock().unwrap().push(feed);

        let bytes = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(SourceStream {
            format: AudioFormat::S16le {
                sample_rate: 48000,
                channels: 2,
            },
            bytes: Box::pin(bytes),
        })
    }
}

pub struct FakeTracks {
    title: Mutex<String>,
}

impl FakeTracks {
    pub fn new(title: &str) -> Arc<Self> {
        Arc::new(Self {
            title: Mutex::new(title.to_string()),
        })
    }

    pub fn set(&self, title: &str) {
        *self.title.lock().unwrap() = title.to_string();
    }
}

#[async_trait]
impl TrackSource for FakeTracks {
    async fn now_playing(&self) -> Result<TrackInfo, MetadataError> {
        Ok(TrackInfo {
            title: self.title.lock().unwrap().clone(),
        })
    }
}

#[derive(Default)]
pub struct FakeLabels {
    applied: Mutex<Vec<(String, String)>>,
}

impl FakeLabels {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied(&self) -> Vec<(String, String)> {
        self.applied.lock().unwrap().clone()
    }
}

#[async_trait]
impl LabelSink for FakeLabels {
    async fn set_label(&self, destination: &Destination, label: &str) -> Result<(), LabelError> {
        self.applied
            .lock()
            .unwrap()
            .push((destination.channel_id.clone(), label.to_string()));
        Ok(())
    }
}
