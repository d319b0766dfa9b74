//! Playback engine
//!
//! Moves frames from the open stream into the voice session's audio output,
//! applying software volume to PCM. Every observable state change is posted to
//! the relay loop as `PlaybackChanged` tagged with the cycle being played.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::state_machine::Event;
use crate::stream::AudioFormat;

pub const MAX_VOLUME: f32 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackState {
    Idle,
    Buffering,
    Playing,
    Error,
}

struct Shared {
    events: mpsc::Sender<Event>,
    state: watch::Sender<PlaybackState>,
    /// f32 bits
    volume: AtomicU32,
}

impl Shared {
    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    async fn transition(&self, cycle: Uuid, next: PlaybackState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::info!("Playback {:?} -> {:?} (cycle {})", previous, next, cycle);
            let _ = self
                .events
                .send(Event::PlaybackChanged { cycle, state: next })
                .await;
        }
    }
}

struct Playback {
    cycle: Uuid,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Player {
    shared: Arc<Shared>,
    active: Mutex<Option<Playback>>,
}

impl Player {
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        let (state, _) = watch::channel(PlaybackState::Idle);
        Self {
            shared: Arc::new(Shared {
                events,
                state,
                volume: AtomicU32::new(1.0f32.to_bits()),
            }),
            active: Mutex::new(None),
        }
    }

    /// Play `frames` into `sink` for restart cycle `cycle`, stopping any previous playback.
    pub async fn play(
        &self,
        cycle: Uuid,
        format: AudioFormat,
        frames: mpsc::Receiver<Bytes>,
        sink: mpsc::Sender<Bytes>,
    ) {
        self.stop().await;

        self.shared.transition(cycle, PlaybackState::Buffering).await;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_playback(
            Arc::clone(&self.shared),
            cycle,
            format,
            frames,
            sink,
            cancel.clone(),
        ));

        *self.active.lock().await = Some(Playback {
            cycle,
            cancel,
            task,
        });
    }

    /// Cancel playback without reporting it. Used by restart teardown.
    pub async fn stop(&self) {
        let previous = self.active.lock().await.take();
        if let Some(playback) = previous {
            playback.cancel.cancel();
            playback.task.abort();
            log::info!("Playback stopped (cycle {})", playback.cycle);
        }
        self.shared.state.send_replace(PlaybackState::Idle);
    }

    /// Set software volume, clamped to `0.0..=MAX_VOLUME`. Only affects PCM sources.
    pub fn set_volume(&self, volume: f32) -> f32 {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, MAX_VOLUME)
        } else {
            1.0
        };
        self.shared
            .volume
            .store(volume.to_bits(), Ordering::Relaxed);
        log::info!("Playback volume set to {:.2}", volume);
        volume
    }

    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    pub fn state(&self) -> PlaybackState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackState> {
        self.shared.state.subscribe()
    }

    pub async fn cycle(&self) -> Option<Uuid> {
        self.active.lock().await.as_ref().map(|playback| playback.cycle)
    }
}

async fn run_playback(
    shared: Arc<Shared>,
    cycle: Uuid,
    format: AudioFormat,
    mut frames: mpsc::Receiver<Bytes>,
    sink: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut scaler = PcmVolume::default();
    let mut started = false;

    loop {
        let frame = tokio::select! {
            biased;

            _ = cancel.cancelled() => return,

            frame = frames.recv() => frame,
        };

        let Some(frame) = frame else {
            log::warn!("Playback source closed (cycle {})", cycle);
            shared.transition(cycle, PlaybackState::Idle).await;
            return;
        };

        let frame = match format {
            AudioFormat::S16le { .. } => scaler.apply(&frame, shared.volume()),
            AudioFormat::Passthrough => frame,
        };
        if frame.is_empty() {
            continue;
        }

        if sink.send(frame).await.is_err() {
            log::warn!("Voice output rejected audio (cycle {})", cycle);
            shared.transition(cycle, PlaybackState::Error).await;
            return;
        }

        if !started {
            started = true;
            shared.transition(cycle, PlaybackState::Playing).await;
        }
    }
}

/// Scales s16le samples. Chunks from the source are not sample aligned, so an
/// odd trailing byte is carried into the next chunk.
#[derive(Debug, Default)]
struct PcmVolume {
    carry: Option<u8>,
}

impl PcmVolume {
    fn apply(&mut self, frame: &[u8], volume: f32) -> Bytes {
        let mut buf = Vec::with_capacity(frame.len() + 1);
        if let Some(byte) = self.carry.take() {
            buf.push(byte);
        }
        buf.extend_from_slice(frame);
        if buf.len() % 2 == 1 {
            self.carry = buf.pop();
        }

        if (volume - 1.0).abs() > f32::EPSILON {
            for sample in buf.chunks_exact_mut(2) {
                let scaled = f32::from(i16::from_le_bytes([sample[0], sample[1]])) * volume;
                let scaled = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
                sample.copy_from_slice(&scaled.to_le_bytes());
            }
        }

        Bytes::from(buf)
    }
}
