//! Voice session connectivity
//!
//! The voice transport itself runs outside this crate. It is reached through two
//! seams: `VoiceGateway` joins a channel and hands back a `VoiceSession`, which
//! publishes its connectivity state and accepts audio frames.
//!
//! # Architecture
//!
//! ```text
//! ConnectionManager ──join──▶ VoiceGateway (bridge.rs, WebSocket sidecar)
//!        │                          │
//!        │ monitor task             ▼
//!        └──────watch────────  VoiceSession ◀── audio frames (player)
//! ```
//!
//! The manager owns at most one live session, watches it for disconnects and
//! reports `ConnectionLost` to the relay loop when the session cannot recover.

pub mod bridge;
pub mod manager;
mod protocol;

pub use bridge::BridgeGateway;
pub use manager::{ConnectionManager, ConnectionTimeouts, SessionInfo};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::stream::AudioFormat;

/// Connectivity of a voice session, as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Signalling,
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

impl ConnectivityState {
    /// True for states a session can still make progress from.
    pub fn is_usable(&self) -> bool {
        matches!(
            self,
            ConnectivityState::Signalling | ConnectivityState::Connecting | ConnectivityState::Ready
        )
    }
}

/// Guild + voice channel the relay plays into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub guild_id: String,
    pub channel_id: String,
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

/// Errors that can occur while establishing or using a voice session
#[derive(Debug, Clone)]
pub enum VoiceError {
    /// Could not reach the voice transport
    ConnectionFailed(String),
    /// Session did not become ready in time
    Timeout(String),
    /// Transport sent something we did not understand, or rejected a request
    Protocol(String),
    /// Session went away while we were waiting on it
    Closed,
    /// No live session to bind audio to
    NoSession,
}

impl std::fmt::Display for VoiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoiceError::ConnectionFailed(e) => write!(f, "Failed to connect to voice bridge: {}", e),
            VoiceError::Timeout(e) => write!(f, "Voice session timed out: {}", e),
            VoiceError::Protocol(e) => write!(f, "Voice bridge protocol error: {}", e),
            VoiceError::Closed => write!(f, "Voice session closed"),
            VoiceError::NoSession => write!(f, "No voice session"),
        }
    }
}

impl std::error::Error for VoiceError {}

/// A joined voice channel.
#[async_trait]
pub trait VoiceSession: Send + Sync {
    fn destination(&self) -> &Destination;

    /// Receiver for connectivity transitions. The current value is the current state.
    fn subscribe(&self) -> watch::Receiver<ConnectivityState>;

    fn state(&self) -> ConnectivityState {
        let states = self.subscribe();
        let current = *states.borrow();
        current
    }

    /// Start accepting audio in `format`. Frames sent on the returned channel are
    /// forwarded to the voice channel until the session goes away.
    async fn audio_output(&self, format: AudioFormat) -> Result<mpsc::Sender<Bytes>, VoiceError>;

    /// Leave the channel and release the session. Idempotent.
    async fn destroy(&self);
}

/// Something that can join voice channels.
#[async_trait]
pub trait VoiceGateway: Send + Sync + 'static {
    async fn join(&self, destination: &Destination) -> Result<Arc<dyn VoiceSession>, VoiceError>;
}
