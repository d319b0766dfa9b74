//! Owns the single live voice session
//!
//! `connect()` replaces whatever session exists with a fresh one and waits for it
//! to become ready. Each session gets a monitor task: when the session drops to
//! `Disconnected` it is given `reacquire` time to start signalling or connecting
//! again, otherwise it is destroyed and `ConnectionLost` is reported for its cycle.
//! A session the bridge reports as `Destroyed` is reported the same way, at once.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ConnectivityState, Destination, VoiceError, VoiceGateway, VoiceSession};
use crate::state_machine::Event;
use crate::stream::AudioFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionTimeouts {
    /// How long a new session may take to reach `Ready`
    pub ready: Duration,
    /// How long a disconnected session may take to start recovering
    pub reacquire: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            ready: Duration::from_secs(20),
            reacquire: Duration::from_secs(5),
        }
    }
}

/// Snapshot of the live session for status reporting.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub cycle: Uuid,
    pub destination: Destination,
    pub state: ConnectivityState,
}

struct ActiveSession {
    cycle: Uuid,
    session: Arc<dyn VoiceSession>,
    monitor: JoinHandle<()>,
}

pub struct ConnectionManager {
    gateway: Arc<dyn VoiceGateway>,
    timeouts: ConnectionTimeouts,
    events: mpsc::Sender<Event>,
    current: Mutex<Option<ActiveSession>>,
}

impl ConnectionManager {
    pub fn new(
        gateway: Arc<dyn VoiceGateway>,
        timeouts: ConnectionTimeouts,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            gateway,
            timeouts,
            events,
            current: Mutex::new(None),
        }
    }

    /// Join `destination` for restart cycle `cycle`, destroying any existing session first.
    ///
    /// Returns once the session reports `Ready`. A session that does not get there
    /// within the ready timeout is destroyed and the join fails.
    pub async fn connect(
        &self,
        destination: &Destination,
        cycle: Uuid,
    ) -> Result<Arc<dyn VoiceSession>, VoiceError> {
        self.disconnect().await;

        log::info!("Joining voice channel {} (cycle {})", destination, cycle);
        let session = self.gateway.join(destination).await?;

        let mut states = session.subscribe();
        let ready = timeout(
            self.timeouts.ready,
            states.wait_for(|state| *state == ConnectivityState::Ready || !state.is_usable()),
        )
        .await
        .map(|result| result.map(|state| *state));

        match ready {
            Ok(Ok(ConnectivityState::Ready)) => {}
            Ok(Ok(state)) => {
                session.destroy().await;
                return Err(VoiceError::Protocol(format!(
                    "session went {:?} before becoming ready",
                    state
                )));
            }
            Ok(Err(_)) => {
                session.destroy().await;
                return Err(VoiceError::Closed);
            }
            Err(_) => {
                session.destroy().await;
                return Err(VoiceError::Timeout(format!(
                    "not ready after {:?}",
                    self.timeouts.ready
                )));
            }
        }

        log::info!("Voice session ready in {} (cycle {})", destination, cycle);

        let monitor = tokio::spawn(monitor_session(
            Arc::clone(&session),
            cycle,
            self.timeouts.reacquire,
            self.events.clone(),
        ));

        let previous = self.current.lock().await.replace(ActiveSession {
            cycle,
            session: Arc::clone(&session),
            monitor,
        });
        if let Some(previous) = previous {
            // Only happens if two connects overlapped
            log::warn!("Replacing voice session from cycle {}", previous.cycle);
            previous.monitor.abort();
            previous.session.destroy().await;
        }

        Ok(session)
    }

    /// Destroy the live session, if any.
    pub async fn disconnect(&self) {
        let previous = self.current.lock().await.take();
        if let Some(active) = previous {
            active.monitor.abort();
            log::info!("Destroying voice session (cycle {})", active.cycle);
            active.session.destroy().await;
        }
    }

    /// Bind an audio output on the live session.
    pub async fn audio_output(
        &self,
        format: AudioFormat,
    ) -> Result<mpsc::Sender<bytes::Bytes>, VoiceError> {
        let session = self
            .current
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.session))
            .ok_or(VoiceError::NoSession)?;
        session.audio_output(format).await
    }

    /// Connectivity of the live session, `None` when there is no session.
    pub async fn current_state(&self) -> Option<ConnectivityState> {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|active| active.session.state())
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.current.lock().await.as_ref().map(|active| SessionInfo {
            cycle: active.cycle,
            destination: active.session.destination().clone(),
            state: active.session.state(),
        })
    }

    /// Periodically check that a usable session exists and raise `WatchdogAlarm` otherwise.
    ///
    /// The watchdog never reconnects by itself; the relay loop decides.
    pub fn spawn_watchdog(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately, skip it
            ticker.tick().await;

            log::info!("Connection watchdog started (every {:?})", interval);
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        log::info!("Connection watchdog cancelled");
                        break;
                    }

                    _ = ticker.tick() => {
                        let state = manager.current_state().await;
                        if state.map_or(true, |s| !s.is_usable()) {
                            log::warn!("Watchdog: voice session is {:?}, requesting restart", state);
                            if manager.events.send(Event::WatchdogAlarm { state }).await.is_err() {
                                log::debug!("Relay loop gone, stopping watchdog");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

async fn monitor_session(
    session: Arc<dyn VoiceSession>,
    cycle: Uuid,
    reacquire: Duration,
    events: mpsc::Sender<Event>,
) {
    let mut states = session.subscribe();
    loop {
        let state = match states
            .wait_for(|state| {
                matches!(
                    state,
                    ConnectivityState::Disconnected | ConnectivityState::Destroyed
                )
            })
            .await
        {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Destroyed,
        };

        // Local teardown aborts the monitor first, so this is the transport's doing
        if state == ConnectivityState::Destroyed {
            log::warn!("Voice session destroyed by the bridge (cycle {})", cycle);
            session.destroy().await;
            let _ = events.send(Event::ConnectionLost { cycle }).await;
            return;
        }

        log::warn!(
            "Voice session disconnected, waiting up to {:?} for it to recover (cycle {})",
            reacquire,
            cycle
        );

        if reacquire_connectivity(session.as_ref(), reacquire).await {
            log::info!("Voice session is reconnecting (cycle {})", cycle);
            continue;
        }

        log::warn!("Voice session did not recover, tearing it down (cycle {})", cycle);
        session.destroy().await;
        let _ = events.send(Event::ConnectionLost { cycle }).await;
        return;
    }
}

/// Wait up to `window` for the session to start signalling or connecting again.
///
/// A session that already got back to `Ready` counts as recovered, the watch
/// channel only keeps the latest state.
async fn reacquire_connectivity(session: &dyn VoiceSession, window: Duration) -> bool {
    let mut states = session.subscribe();
    let recovered = async {
        match states.wait_for(|s| s.is_usable() || *s == ConnectivityState::Destroyed).await {
            Ok(state) => state.is_usable(),
            Err(_) => false,
        }
    };

    matches!(timeout(window, recovered).await, Ok(true))
}
