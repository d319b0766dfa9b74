pub mod connection;
pub mod control;
pub mod effects;
pub mod metadata;
pub mod player;
mod secrets;
pub mod settings;
pub mod state_machine;
pub mod status;
pub mod stream;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use connection::{BridgeGateway, ConnectionManager, Destination, VoiceGateway};
use effects::{EffectRunner, RelayEffectRunner, RestartPlan};
use metadata::{ChannelLabeler, LabelSink, MetadataPoller, NowPlayingClient, TrackSource};
use player::Player;
use settings::{RelaySettings, SourceMode};
use state_machine::{reduce, Effect, Event, RestartReason, State};
use status::{CoordinatorSnapshot, DebugReport, RelayStatus};
use stream::{FfmpegConnector, HttpConnector, SourceConnector, StreamAdapter};

/// Events queued for the relay loop
const EVENT_BUFFER: usize = 64;

/// How long the runtime waits for stray blocking tasks (stdin) on exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Now-playing source and channel label sink. Absent when relabeling is disabled.
pub struct MetadataParts {
    pub tracks: Arc<dyn TrackSource>,
    pub labels: Arc<dyn LabelSink>,
}

/// The external edges of the relay.
pub struct RelayParts {
    pub gateway: Arc<dyn VoiceGateway>,
    pub connector: Arc<dyn SourceConnector>,
    pub metadata: Option<MetadataParts>,
}

/// A running relay: the relay loop, its components and background tasks.
pub struct RelayHandle {
    tx: mpsc::Sender<Event>,
    coordinator: watch::Receiver<CoordinatorSnapshot>,
    destination: Destination,
    connection: Arc<ConnectionManager>,
    streams: Arc<StreamAdapter>,
    player: Arc<Player>,
    metadata: Option<Arc<MetadataPoller>>,
    cancel: CancellationToken,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayHandle {
    /// Wire the components together, start the relay loop and background tasks,
    /// and kick off the first restart. Must be called inside a tokio runtime.
    pub fn start(settings: &RelaySettings, parts: RelayParts) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_BUFFER);
        let destination = settings.destination();

        let connection = Arc::new(ConnectionManager::new(
            parts.gateway,
            settings.connection_timeouts(),
            tx.clone(),
        ));
        let streams = Arc::new(StreamAdapter::new(parts.connector, tx.clone()));
        let player = Arc::new(Player::new(tx.clone()));
        player.set_volume(settings.volume);

        let runner = RelayEffectRunner::new(
            RestartPlan {
                destination: destination.clone(),
                stream_url: settings.stream_url.clone(),
            },
            Arc::clone(&connection),
            Arc::clone(&streams),
            Arc::clone(&player),
        );

        let initial = State::new(settings.restart_retry_delay());
        let (snapshot_tx, snapshot_rx) = watch::channel(CoordinatorSnapshot::from(&initial));

        let cancel = CancellationToken::new();
        let mut background =
            vec![connection.spawn_watchdog(settings.watchdog_interval(), cancel.clone())];

        let metadata = parts.metadata.map(|parts| {
            let poller = Arc::new(MetadataPoller::new(
                parts.tracks,
                parts.labels,
                destination.clone(),
                settings.metadata_interval(),
                settings.label_prefix.clone(),
                settings.label_max_len,
            ));
            background.push(poller.spawn(cancel.clone()));
            poller
        });

        if let Err(e) = tx.try_send(Event::Start) {
            log::error!("Failed to queue relay start: {}", e);
        }

        let loop_task = tokio::spawn(run_relay_loop(
            rx,
            tx.clone(),
            runner,
            snapshot_tx,
            initial,
        ));

        Self {
            tx,
            coordinator: snapshot_rx,
            destination,
            connection,
            streams,
            player,
            metadata,
            cancel,
            loop_task: Mutex::new(Some(loop_task)),
            background: Mutex::new(background),
        }
    }

    /// Send an event to the relay loop
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    /// Manual restart, subject to single-flight.
    pub async fn request_restart(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::RestartRequested {
            reason: RestartReason::Manual,
        })
        .await
    }

    /// Clear a stuck restart and restart immediately.
    pub async fn force_restart(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::ForceRestart).await
    }

    /// Force a relabel from the current track. Returns false when metadata is disabled.
    pub async fn refresh_metadata(&self) -> bool {
        match &self.metadata {
            Some(poller) => {
                poller.refresh().await;
                true
            }
            None => false,
        }
    }

    /// Latest coordinator snapshot published by the relay loop.
    pub fn coordinator(&self) -> CoordinatorSnapshot {
        self.coordinator.borrow().clone()
    }

    pub fn watch_coordinator(&self) -> watch::Receiver<CoordinatorSnapshot> {
        self.coordinator.clone()
    }

    pub async fn status(&self) -> RelayStatus {
        let coordinator = self.coordinator();
        let connectivity = self.connection.current_state().await;
        let stream = self.streams.info().await;
        let track = match &self.metadata {
            Some(poller) => Some(poller.snapshot().await),
            None => None,
        };

        RelayStatus {
            destination: self.destination.clone(),
            connectivity,
            playback: self.player.state(),
            restarting: coordinator.in_flight,
            retry_scheduled: coordinator.pending_retry.is_some(),
            stream_url: stream.map(|info| info.url),
            now_playing: track
                .and_then(|t| t.last_observed_title)
                .filter(|title| !title.trim().is_empty()),
            restarts: coordinator.stats.started,
            last_restart_at: coordinator.last_restart_at,
            last_error: coordinator.last_error,
        }
    }

    pub async fn debug_report(&self) -> DebugReport {
        let session = self.connection.session_info().await;
        let track = match &self.metadata {
            Some(poller) => Some(poller.snapshot().await),
            None => None,
        };

        DebugReport {
            coordinator: self.coordinator(),
            session_cycle: session.as_ref().map(|s| s.cycle),
            connectivity: session.as_ref().map(|s| s.state),
            playback: self.player.state(),
            playback_cycle: self.player.cycle().await,
            volume: self.player.volume(),
            stream: self.streams.info().await,
            track,
            generated_at: chrono::Utc::now(),
        }
    }

    /// Stop the relay loop and background tasks, then tear down playback, stream
    /// and session. Safe to call more than once.
    pub async fn shutdown(&self) {
        log::info!("Shutting down relay");
        self.cancel.cancel();
        let _ = self.tx.send(Event::Shutdown).await;

        let loop_task = self.loop_task.lock().await.take();
        if let Some(task) = loop_task {
            if let Err(e) = task.await {
                log::warn!("Relay loop task failed: {}", e);
            }
        }

        let background = std::mem::take(&mut *self.background.lock().await);
        for task in background {
            let _ = task.await;
        }

        self.player.stop().await;
        self.streams.close().await;
        self.connection.disconnect().await;
        log::info!("Relay stopped");
    }
}

/// Run the relay loop
async fn run_relay_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    effect_runner: Arc<dyn EffectRunner>,
    snapshot: watch::Sender<CoordinatorSnapshot>,
    mut state: State,
) {
    log::info!("Relay loop started");

    while let Some(event) = rx.recv().await {
        log::debug!("Received event: {:?}", event);

        // Handle Shutdown at the edge
        if matches!(event, Event::Shutdown) {
            log::info!("Shutdown requested, stopping relay loop");
            break;
        }

        let (next, effects) = reduce(&state, event);

        if state.in_flight != next.in_flight {
            log::info!(
                "Restart in flight: {} -> {}",
                state.in_flight,
                next.in_flight
            );
        }

        state = next;

        // Execute effects
        for eff in effects {
            match eff {
                Effect::Publish => {
                    snapshot.send_replace(CoordinatorSnapshot::from(&state));
                }
                other => effect_runner.spawn(other, tx.clone()),
            }
        }
    }

    effect_runner.shutdown();
    log::info!("Relay loop ended");
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if let Err(e) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        eprintln!("Logging already initialized: {}", e);
    }
}

fn build_parts(settings: &RelaySettings, token: Option<String>) -> Result<RelayParts, String> {
    let gateway: Arc<dyn VoiceGateway> =
        Arc::new(BridgeGateway::new(settings.bridge_url.clone(), token.clone()));

    let connector: Arc<dyn SourceConnector> = match settings.source {
        SourceMode::Ffmpeg => Arc::new(FfmpegConnector::new(settings.decode_config())),
        SourceMode::Http => Arc::new(
            HttpConnector::new(settings.http_retry_policy()).map_err(|e| e.to_string())?,
        ),
    };

    let metadata = if settings.status_url.trim().is_empty() {
        log::info!("status_url not set, channel relabeling disabled");
        None
    } else if let Some(token) = token {
        Some(MetadataParts {
            tracks: Arc::new(NowPlayingClient::new(settings.status_url.clone())?),
            labels: Arc::new(ChannelLabeler::new(settings.api_base.clone(), token)?),
        })
    } else {
        log::warn!("No bot token configured, channel relabeling disabled");
        None
    };

    Ok(RelayParts {
        gateway,
        connector,
        metadata,
    })
}

async fn run_until_stopped(settings: RelaySettings) -> Result<(), String> {
    let token = secrets::get_bot_token();
    if token.is_none() {
        log::warn!(
            "No bot token found ({} or keyring), connecting to the voice bridge unauthenticated",
            secrets::TOKEN_ENV
        );
    }

    let parts = build_parts(&settings, token)?;
    log::info!(
        "Relaying {} into {} via {}",
        settings.stream_url,
        settings.destination(),
        settings.bridge_url
    );

    let relay = Arc::new(RelayHandle::start(&settings, parts));
    let mut console = tokio::spawn(control::run_console(Arc::clone(&relay)));

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => log::info!("Interrupted"),
            Err(e) => log::warn!("Failed to listen for ctrl-c: {}", e),
        },
        _ = &mut console => log::info!("Console exited"),
    }

    console.abort();
    relay.shutdown().await;
    Ok(())
}

pub fn run() -> Result<(), String> {
    init_logging();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("rustls crypto provider already installed");
    }

    let settings = settings::load_settings();
    settings.validate()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start tokio runtime: {}", e))?;

    let result = runtime.block_on(run_until_stopped(settings));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}
