//! Effect runner for the relay
//!
//! This module executes effects produced by the restart coordinator. Each effect
//! runs in its own task and reports back to the relay loop by posting an event.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::connection::{ConnectionManager, Destination};
use crate::player::Player;
use crate::state_machine::{Effect, Event, RestartReason};
use crate::stream::StreamAdapter;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);

    /// Abort whatever is still running. Called once when the relay loop exits.
    fn shutdown(&self) {}
}

/// Where a restart connects to and what it plays.
#[derive(Debug, Clone)]
pub struct RestartPlan {
    pub destination: Destination,
    pub stream_url: String,
}

/// Runs restarts against the real connection manager, stream adapter and player.
pub struct RelayEffectRunner {
    plan: RestartPlan,
    connection: Arc<ConnectionManager>,
    streams: Arc<StreamAdapter>,
    player: Arc<Player>,
    restart_task: Mutex<Option<JoinHandle<()>>>,
    retry_timers: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl RelayEffectRunner {
    pub fn new(
        plan: RestartPlan,
        connection: Arc<ConnectionManager>,
        streams: Arc<StreamAdapter>,
        player: Arc<Player>,
    ) -> Arc<Self> {
        Arc::new(Self {
            plan,
            connection,
            streams,
            player,
            restart_task: Mutex::new(None),
            retry_timers: Arc::new(Mutex::new(HashMap::new())),
        })
    }
}

impl EffectRunner for RelayEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::RunRestart { id, reason } => {
                let plan = self.plan.clone();
                let connection = Arc::clone(&self.connection);
                let streams = Arc::clone(&self.streams);
                let player = Arc::clone(&self.player);

                let task = tokio::spawn(async move {
                    let event = match restart_sequence(&plan, &connection, &streams, &player, id, reason).await {
                        Ok(()) => Event::RestartSucceeded { id },
                        Err(err) => {
                            log::error!("Restart {} failed: {}", id, err);
                            Event::RestartFailed { id, err }
                        }
                    };
                    let _ = tx.send(event).await;
                });

                let previous = self
                    .restart_task
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(task);
                if let Some(previous) = previous {
                    if !previous.is_finished() {
                        // Only a forced restart can overlap a running one
                        log::warn!("Aborting unfinished restart task");
                        previous.abort();
                    }
                }
            }

            Effect::ScheduleRetry { id, delay } => {
                let cancel = CancellationToken::new();
                self.retry_timers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(id, cancel.clone());
                let timers = Arc::clone(&self.retry_timers);

                tokio::spawn(async move {
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => {
                            log::debug!("Retry timer {} cancelled", id);
                        }

                        _ = tokio::time::sleep(delay) => {
                            timers
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&id);
                            log::debug!("Retry timer {} fired", id);
                            let _ = tx.send(Event::RetryTimerFired { id }).await;
                        }
                    }
                });
            }

            Effect::CancelRetry { id } => {
                let timer = self
                    .retry_timers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                if let Some(cancel) = timer {
                    cancel.cancel();
                }
            }

            Effect::Publish => {
                log::debug!("Publish is handled by the relay loop");
            }
        }
    }

    fn shutdown(&self) {
        let task = self
            .restart_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        let timers: Vec<_> = self
            .retry_timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (_, cancel) in timers {
            cancel.cancel();
        }
    }
}

/// Destroy-then-recreate: tear everything down, then build a fresh session,
/// stream and playback tagged with cycle `id`.
async fn restart_sequence(
    plan: &RestartPlan,
    connection: &ConnectionManager,
    streams: &StreamAdapter,
    player: &Player,
    id: Uuid,
    reason: RestartReason,
) -> Result<(), String> {
    log::info!("Restart {} ({}): tearing down", id, reason);
    player.stop().await;
    connection.disconnect().await;
    streams.close().await;

    connection
        .connect(&plan.destination, id)
        .await
        .map_err(|e| format!("connect: {}", e))?;

    let opened = streams
        .open(&plan.stream_url, id)
        .await
        .map_err(|e| format!("open stream: {}", e))?;

    let sink = connection
        .audio_output(opened.format)
        .await
        .map_err(|e| format!("bind audio: {}", e))?;

    player.play(id, opened.format, opened.frames, sink).await;
    log::info!("Restart {}: playing {}", id, plan.stream_url);
    Ok(())
}
