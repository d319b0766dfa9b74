//! Status and debug snapshots
//!
//! `RelayStatus` answers the read-only `status` command. `DebugReport` is the
//! privileged `debug` dump with coordinator internals and per-component state.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::connection::{ConnectivityState, Destination};
use crate::metadata::TrackSnapshot;
use crate::player::PlaybackState;
use crate::state_machine::{RestartReason, RestartStats, State};
use crate::stream::StreamInfo;

/// Coordinator state as published by the relay loop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoordinatorSnapshot {
    pub in_flight: bool,
    pub attempt_id: Option<Uuid>,
    pub attempt_reason: Option<RestartReason>,
    pub attempt_faulted: bool,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub pending_retry: Option<Uuid>,
    pub live_cycle: Option<Uuid>,
    pub last_reason: Option<RestartReason>,
    pub last_error: Option<String>,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub stats: RestartStats,
}

impl From<&State> for CoordinatorSnapshot {
    fn from(state: &State) -> Self {
        Self {
            in_flight: state.in_flight,
            attempt_id: state.attempt.as_ref().map(|a| a.id),
            attempt_reason: state.attempt.as_ref().map(|a| a.reason),
            attempt_faulted: state.attempt.as_ref().is_some_and(|a| a.faulted),
            attempt_started_at: state.attempt.as_ref().map(|a| a.started_at),
            pending_retry: state.pending_retry,
            live_cycle: state.live_cycle,
            last_reason: state.last_reason,
            last_error: state.last_error.clone(),
            last_restart_at: state.last_restart_at,
            stats: state.stats.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub destination: Destination,
    /// `None` when no session exists
    pub connectivity: Option<ConnectivityState>,
    pub playback: PlaybackState,
    pub restarting: bool,
    pub retry_scheduled: bool,
    pub stream_url: Option<String>,
    pub now_playing: Option<String>,
    pub restarts: u64,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl RelayStatus {
    /// Connected, playing and not in the middle of a restart.
    pub fn is_healthy(&self) -> bool {
        self.connectivity == Some(ConnectivityState::Ready)
            && self.playback == PlaybackState::Playing
            && !self.restarting
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        let connection = match self.connectivity {
            Some(state) => format!("{:?}", state).to_lowercase(),
            None => "no session".to_string(),
        };
        let mut line = format!(
            "{} | voice: {} | playback: {}",
            if self.is_healthy() { "healthy" } else { "degraded" },
            connection,
            format!("{:?}", self.playback).to_lowercase()
        );
        if self.restarting {
            line.push_str(" | restarting");
        } else if self.retry_scheduled {
            line.push_str(" | retry scheduled");
        }
        if let Some(title) = &self.now_playing {
            line.push_str(&format!(" | now playing: {}", title));
        }
        line
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugReport {
    pub coordinator: CoordinatorSnapshot,
    pub session_cycle: Option<Uuid>,
    pub connectivity: Option<ConnectivityState>,
    pub playback: PlaybackState,
    pub playback_cycle: Option<Uuid>,
    pub volume: f32,
    pub stream: Option<StreamInfo>,
    pub track: Option<TrackSnapshot>,
    pub generated_at: DateTime<Utc>,
}
