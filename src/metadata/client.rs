//! HTTP clients for the now-playing endpoint and the Discord channel API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use super::{LabelError, LabelSink, MetadataError, TrackInfo, TrackSource};
use crate::connection::Destination;

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct NowPlayingResponse {
    current_track: CurrentTrack,
}

#[derive(Debug, Deserialize)]
struct CurrentTrack {
    #[serde(default)]
    title: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

fn build_client() -> Result<Client, String> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| format!("Failed to build HTTP client: {}", e))
}

/// Parse a now-playing document. Fields other than `current_track.title` are ignored.
pub(crate) fn parse_now_playing(body: &str) -> Result<TrackInfo, MetadataError> {
    let response: NowPlayingResponse =
        serde_json::from_str(body).map_err(|e| MetadataError::Parse(e.to_string()))?;
    Ok(TrackInfo {
        title: response.current_track.title,
    })
}

/// Reads the station's now-playing document.
pub struct NowPlayingClient {
    client: Client,
    url: String,
}

impl NowPlayingClient {
    pub fn new(url: impl Into<String>) -> Result<Self, String> {
        Ok(Self {
            client: build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl TrackSource for NowPlayingClient {
    async fn now_playing(&self) -> Result<TrackInfo, MetadataError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MetadataError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MetadataError::Network(e.to_string()))?;
        parse_now_playing(&body)
    }
}

/// Renames voice channels through the Discord REST API.
pub struct ChannelLabeler {
    client: Client,
    api_base: String,
    token: String,
}

impl ChannelLabeler {
    pub fn new(api_base: impl Into<String>, token: impl Into<String>) -> Result<Self, String> {
        Ok(Self {
            client: build_client()?,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }
}

#[async_trait]
impl LabelSink for ChannelLabeler {
    async fn set_label(&self, destination: &Destination, label: &str) -> Result<(), LabelError> {
        let url = format!("{}/channels/{}", self.api_base, destination.channel_id);

        let response = self
            .client
            .patch(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&json!({ "name": label }))
            .send()
            .await
            .map_err(|e| LabelError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = serde_json::from_str::<RateLimitBody>(&body)
                .ok()
                .and_then(|b| b.retry_after);
            return Err(LabelError::RateLimited { retry_after });
        }

        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|b| b.message)
            .unwrap_or(body);
        Err(LabelError::Api {
            status: status.as_u16(),
            message: match status.as_u16() {
                401 => "Invalid bot token".to_string(),
                403 => format!("Missing permission to manage channel: {}", message),
                _ => message,
            },
        })
    }
}
