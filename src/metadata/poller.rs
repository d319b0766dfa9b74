//! Polls the now-playing title and relabels the voice channel when it changes.
//!
//! Every failure here is non-fatal: it is logged, recorded in the snapshot and
//! the next tick tries again. A rate-limited rename does not advance the
//! last-applied title, so the same title is retried on the next tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{LabelError, LabelSink, TrackSource};
use crate::connection::Destination;

/// Poller bookkeeping, reported through `status` and `debug`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackSnapshot {
    pub last_applied_title: Option<String>,
    pub last_observed_title: Option<String>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub relabels: u64,
    pub rate_limited: u64,
}

/// What a single poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Relabeled,
    Unchanged,
    Empty,
    RateLimited,
    Failed,
}

/// First `max_chars` characters of `label`.
pub fn truncate_label(label: &str, max_chars: usize) -> String {
    match label.char_indices().nth(max_chars) {
        Some((cut, _)) => label[..cut].to_string(),
        None => label.to_string(),
    }
}

pub struct MetadataPoller {
    tracks: Arc<dyn TrackSource>,
    labels: Arc<dyn LabelSink>,
    destination: Destination,
    interval: Duration,
    label_prefix: String,
    label_max_len: usize,
    snapshot: Mutex<TrackSnapshot>,
    refresh: Notify,
}

impl MetadataPoller {
    pub fn new(
        tracks: Arc<dyn TrackSource>,
        labels: Arc<dyn LabelSink>,
        destination: Destination,
        interval: Duration,
        label_prefix: impl Into<String>,
        label_max_len: usize,
    ) -> Self {
        Self {
            tracks,
            labels,
            destination,
            interval,
            label_prefix: label_prefix.into(),
            label_max_len,
            snapshot: Mutex::new(TrackSnapshot::default()),
            refresh: Notify::new(),
        }
    }

    /// Fetch the current title once and relabel if it changed.
    pub async fn poll_once(&self) -> PollOutcome {
        let fetched = self.tracks.now_playing().await;

        let last_applied = {
            let mut snapshot = self.snapshot.lock().await;
            snapshot.last_polled_at = Some(Utc::now());
            match &fetched {
                Ok(track) => {
                    snapshot.last_observed_title = Some(track.title.clone());
                    snapshot.last_error = None;
                }
                Err(e) => snapshot.last_error = Some(e.to_string()),
            }
            snapshot.last_applied_title.clone()
        };

        let track = match fetched {
            Ok(track) => track,
            Err(e) => {
                log::warn!("Now playing fetch failed: {}", e);
                return PollOutcome::Failed;
            }
        };

        let title = track.title.trim();
        if title.is_empty() {
            return PollOutcome::Empty;
        }
        if last_applied.as_deref() == Some(title) {
            return PollOutcome::Unchanged;
        }

        let label = truncate_label(
            &format!("{}{}", self.label_prefix, title),
            self.label_max_len,
        );

        match self.labels.set_label(&self.destination, &label).await {
            Ok(()) => {
                log::info!("Channel label set to \"{}\"", label);
                let mut snapshot = self.snapshot.lock().await;
                snapshot.last_applied_title = Some(title.to_string());
                snapshot.last_error = None;
                snapshot.relabels += 1;
                PollOutcome::Relabeled
            }
            Err(LabelError::RateLimited { retry_after }) => {
                log::info!(
                    "Channel relabel rate limited (retry after {:?}s), skipping \"{}\"",
                    retry_after,
                    title
                );
                self.snapshot.lock().await.rate_limited += 1;
                PollOutcome::RateLimited
            }
            Err(e) => {
                log::warn!("Channel relabel failed: {}", e);
                self.snapshot.lock().await.last_error = Some(e.to_string());
                PollOutcome::Failed
            }
        }
    }

    /// Forget the applied title and poll immediately, forcing a relabel.
    pub async fn refresh(&self) {
        self.snapshot.lock().await.last_applied_title = None;
        self.refresh.notify_one();
    }

    pub async fn snapshot(&self) -> TrackSnapshot {
        self.snapshot.lock().await.clone()
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("Metadata poller started (every {:?})", poller.interval);

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => {
                        log::info!("Metadata poller cancelled");
                        break;
                    }

                    _ = poller.refresh.notified() => {
                        log::info!("Metadata refresh requested");
                    }

                    _ = ticker.tick() => {}
                }

                poller.poll_once().await;
            }
        })
    }
}
