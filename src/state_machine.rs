//! Restart coordinator state machine
//!
//! This module implements the relay's recovery logic using a single-writer pattern.
//! Every failure signal and operator command arrives as an `Event`; `reduce()` turns
//! the current state plus one event into the next state and a list of effects.
//! Because only the relay loop calls `reduce()`, the in-flight check-and-set below
//! never races with another trigger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::connection::ConnectivityState;
use crate::player::PlaybackState;

/// Why a restart was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    Startup,
    ConnectionLost,
    StreamError,
    StreamEnded,
    PlaybackIdle,
    PlaybackError,
    Watchdog,
    ScheduledRetry,
    Manual,
    ManualFix,
}

impl RestartReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartReason::Startup => "startup",
            RestartReason::ConnectionLost => "connection lost",
            RestartReason::StreamError => "stream error",
            RestartReason::StreamEnded => "stream ended",
            RestartReason::PlaybackIdle => "playback idle",
            RestartReason::PlaybackError => "playback error",
            RestartReason::Watchdog => "watchdog",
            RestartReason::ScheduledRetry => "scheduled retry",
            RestartReason::Manual => "manual restart",
            RestartReason::ManualFix => "manual fix",
        }
    }
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The restart sequence currently executing.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Cycle id handed to the session, stream and player this attempt creates
    pub id: Uuid,
    pub reason: RestartReason,
    /// Set when the attempt's own session/stream/player failed before it reported back
    pub faulted: bool,
    pub started_at: DateTime<Utc>,
}

/// Running counters, reported through `debug`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestartStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Requests that arrived while a restart was in flight
    pub dropped: u64,
    pub consecutive_failures: u32,
}

/// Coordinator state. This is the authoritative restart flag.
#[derive(Debug, Clone)]
pub struct State {
    pub in_flight: bool,
    pub attempt: Option<Attempt>,
    /// Id of the scheduled retry timer, if one is pending
    pub pending_retry: Option<Uuid>,
    /// Cycle whose session/stream/player are currently live
    pub live_cycle: Option<Uuid>,
    pub retry_delay: Duration,
    pub last_reason: Option<RestartReason>,
    pub last_error: Option<String>,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub stats: RestartStats,
}

impl State {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            in_flight: false,
            attempt: None,
            pending_retry: None,
            live_cycle: None,
            retry_delay,
            last_reason: None,
            last_error: None,
            last_restart_at: None,
            stats: RestartStats::default(),
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::new(Duration::from_secs(5))
    }
}

/// Events that can trigger state transitions.
/// These are sent by the connection manager, stream adapter, player, watchdog,
/// effect runner and operator commands.
#[derive(Debug, Clone)]
pub enum Event {
    /// Relay booted, bring up the first session
    Start,
    /// Operator `restart` command
    RestartRequested {
        reason: RestartReason,
    },
    /// Operator `fix` command: clear a stuck in-flight flag and restart now
    ForceRestart,
    /// Shut the relay loop down
    Shutdown,

    // Component failure signals (tagged with the cycle that produced them)
    ConnectionLost {
        cycle: Uuid,
    },
    StreamFailed {
        cycle: Uuid,
        err: String,
    },
    StreamEnded {
        cycle: Uuid,
    },
    PlaybackChanged {
        cycle: Uuid,
        state: PlaybackState,
    },
    /// Watchdog found no usable session
    WatchdogAlarm {
        state: Option<ConnectivityState>,
    },

    // Effect completions
    RestartSucceeded {
        id: Uuid,
    },
    RestartFailed {
        id: Uuid,
        err: String,
    },
    RetryTimerFired {
        id: Uuid,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Tear down session + stream + player and build fresh ones tagged `id`
    RunRestart { id: Uuid, reason: RestartReason },
    ScheduleRetry { id: Uuid, delay: Duration },
    CancelRetry { id: Uuid },
    /// Publish a fresh coordinator snapshot
    Publish,
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - At most one restart in flight; requests arriving meanwhile are dropped, not queued
/// - Events from a cycle that is no longer live are ignored
/// - `in_flight` is cleared only when the attempt reports back
pub fn reduce(state: &State, event: Event) -> (State, Vec<Effect>) {
    use Event::*;

    match event {
        Start => begin_restart(state, RestartReason::Startup),
        RestartRequested { reason } => begin_restart(state, reason),

        ForceRestart => {
            let mut next = state.clone();
            let mut effects = Vec::new();
            if let Some(attempt) = next.attempt.take() {
                log::warn!(
                    "Force-clearing in-flight restart {} ({})",
                    attempt.id,
                    attempt.reason
                );
            }
            next.in_flight = false;
            if let Some(id) = next.pending_retry.take() {
                effects.push(Effect::CancelRetry { id });
            }
            let (next, more) = begin_restart(&next, RestartReason::ManualFix);
            effects.extend(more);
            (next, effects)
        }

        ConnectionLost { cycle } => fault(state, cycle, RestartReason::ConnectionLost, None),
        StreamFailed { cycle, err } => fault(state, cycle, RestartReason::StreamError, Some(err)),
        StreamEnded { cycle } => fault(state, cycle, RestartReason::StreamEnded, None),
        PlaybackChanged {
            cycle,
            state: playback,
        } => match playback {
            PlaybackState::Idle => fault(state, cycle, RestartReason::PlaybackIdle, None),
            PlaybackState::Error => fault(state, cycle, RestartReason::PlaybackError, None),
            PlaybackState::Buffering | PlaybackState::Playing => (state.clone(), vec![]),
        },

        WatchdogAlarm { state: connectivity } => {
            log::warn!("Watchdog alarm (session state: {:?})", connectivity);
            begin_restart(state, RestartReason::Watchdog)
        }

        RestartSucceeded { id } => match &state.attempt {
            Some(attempt) if state.in_flight && attempt.id == id => {
                if attempt.faulted {
                    fail_attempt(state, "cycle faulted before the restart completed".to_string())
                } else {
                    let mut next = state.clone();
                    next.in_flight = false;
                    next.attempt = None;
                    next.live_cycle = Some(id);
                    next.stats.succeeded += 1;
                    next.stats.consecutive_failures = 0;
                    log::info!("Restart {} complete, relay is live", id);
                    (next, vec![Effect::Publish])
                }
            }
            _ => {
                log::debug!("Ignoring completion of superseded restart {}", id);
                (state.clone(), vec![])
            }
        },

        RestartFailed { id, err } => match &state.attempt {
            Some(attempt) if state.in_flight && attempt.id == id => fail_attempt(state, err),
            _ => {
                log::debug!("Ignoring failure of superseded restart {}: {}", id, err);
                (state.clone(), vec![])
            }
        },

        RetryTimerFired { id } => {
            if state.pending_retry == Some(id) {
                let mut next = state.clone();
                next.pending_retry = None;
                begin_restart(&next, RestartReason::ScheduledRetry)
            } else {
                log::debug!("Ignoring cancelled retry timer {}", id);
                (state.clone(), vec![])
            }
        }

        // Handled at the loop edge
        Shutdown => (state.clone(), vec![]),
    }
}

/// The single-flight gate.
fn begin_restart(state: &State, reason: RestartReason) -> (State, Vec<Effect>) {
    let mut next = state.clone();

    if state.in_flight {
        next.stats.dropped += 1;
        log::info!("Restart already in flight, dropping {} request", reason);
        return (next, vec![Effect::Publish]);
    }

    let mut effects = Vec::new();
    if let Some(timer) = next.pending_retry.take() {
        effects.push(Effect::CancelRetry { id: timer });
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    log::info!("Starting restart {} ({})", id, reason);

    next.in_flight = true;
    next.attempt = Some(Attempt {
        id,
        reason,
        faulted: false,
        started_at: now,
    });
    next.last_reason = Some(reason);
    next.last_restart_at = Some(now);
    next.stats.started += 1;

    effects.push(Effect::RunRestart { id, reason });
    effects.push(Effect::Publish);
    (next, effects)
}

fn fault(
    state: &State,
    cycle: Uuid,
    reason: RestartReason,
    detail: Option<String>,
) -> (State, Vec<Effect>) {
    if state.live_cycle == Some(cycle) {
        match detail {
            Some(detail) => log::warn!("Relay fault ({}): {}", reason, detail),
            None => log::warn!("Relay fault ({})", reason),
        }
        return begin_restart(state, reason);
    }

    if let Some(attempt) = &state.attempt {
        if state.in_flight && attempt.id == cycle {
            if attempt.faulted {
                return (state.clone(), vec![]);
            }
            log::warn!("Restart {} faulted before completing ({})", cycle, reason);
            let mut next = state.clone();
            if let Some(attempt) = next.attempt.as_mut() {
                attempt.faulted = true;
            }
            return (next, vec![Effect::Publish]);
        }
    }

    log::debug!("Ignoring stale {} event from cycle {}", reason, cycle);
    (state.clone(), vec![])
}

fn fail_attempt(state: &State, err: String) -> (State, Vec<Effect>) {
    let mut next = state.clone();
    let timer = Uuid::new_v4();

    next.in_flight = false;
    next.attempt = None;
    next.live_cycle = None;
    next.pending_retry = Some(timer);
    next.last_error = Some(err.clone());
    next.stats.failed += 1;
    next.stats.consecutive_failures += 1;

    log::warn!(
        "Restart failed ({}), retrying in {:?} (failure #{})",
        err,
        state.retry_delay,
        next.stats.consecutive_failures
    );

    (
        next,
        vec![
            Effect::ScheduleRetry {
                id: timer,
                delay: state.retry_delay,
            },
            Effect::Publish,
        ],
    )
}
