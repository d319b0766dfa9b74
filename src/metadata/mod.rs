//! Track metadata: read the station's now-playing title and mirror it onto the
//! voice channel's label.

mod client;
mod poller;

pub use client::{ChannelLabeler, NowPlayingClient, DISCORD_API_BASE};
pub use poller::{truncate_label, MetadataPoller, PollOutcome, TrackSnapshot};

use async_trait::async_trait;

use crate::connection::Destination;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub title: String,
}

/// Errors fetching the now-playing document
#[derive(Debug, Clone)]
pub enum MetadataError {
    Network(String),
    Status(u16),
    Parse(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Network(e) => write!(f, "Network error fetching now playing: {}", e),
            MetadataError::Status(code) => write!(f, "Now playing endpoint returned HTTP {}", code),
            MetadataError::Parse(e) => write!(f, "Failed to parse now playing response: {}", e),
        }
    }
}

impl std::error::Error for MetadataError {}

/// Errors applying a channel label
#[derive(Debug, Clone)]
pub enum LabelError {
    /// Too many renames; Discord allows only a couple per channel every few minutes
    RateLimited { retry_after: Option<f64> },
    Network(String),
    Api { status: u16, message: String },
}

impl std::fmt::Display for LabelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LabelError::RateLimited {
                retry_after: Some(secs),
            } => write!(f, "Rate limited, retry after {:.1}s", secs),
            LabelError::RateLimited { retry_after: None } => write!(f, "Rate limited"),
            LabelError::Network(e) => write!(f, "Network error updating channel: {}", e),
            LabelError::Api { status, message } => write!(f, "API error {}: {}", status, message),
        }
    }
}

impl std::error::Error for LabelError {}

#[async_trait]
pub trait TrackSource: Send + Sync + 'static {
    async fn now_playing(&self) -> Result<TrackInfo, MetadataError>;
}

#[async_trait]
pub trait LabelSink: Send + Sync + 'static {
    async fn set_label(&self, destination: &Destination, label: &str) -> Result<(), LabelError>;
}
