use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::{ConnectionTimeouts, Destination};
use crate::metadata::DISCORD_API_BASE;
use crate::stream::{DecodeConfig, RetryPolicy};

const SETTINGS_DIR_NAME: &str = "radio-relay";
const SETTINGS_FILE_NAME: &str = "settings.json";

/// Overrides the settings file location.
pub const SETTINGS_PATH_ENV: &str = "RELAY_SETTINGS";

/// How the upstream stream is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Decode through an ffmpeg child process
    #[default]
    Ffmpeg,
    /// Fetch the encoded stream directly
    Http,
}

impl std::str::FromStr for SourceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Ok(SourceMode::Ffmpeg),
            "http" => Ok(SourceMode::Http),
            other => Err(format!("unknown source mode {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Radio stream to relay.
    pub stream_url: String,

    /// Now-playing JSON document. Empty disables channel relabeling.
    pub status_url: String,

    pub guild_id: String,
    pub channel_id: String,

    /// WebSocket endpoint of the voice bridge.
    pub bridge_url: String,

    pub source: SourceMode,

    pub ffmpeg_path: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: u32,

    /// HTTP source reconnects per outage, and their linear backoff.
    pub http_max_retries: u32,
    pub http_retry_step_ms: u64,
    pub http_retry_max_ms: u64,

    /// Delay before retrying a failed restart.
    pub restart_retry_delay_ms: u64,

    /// How long a disconnected session may take to start recovering.
    pub reacquire_timeout_ms: u64,

    /// How long a fresh session may take to become ready.
    pub ready_timeout_ms: u64,

    pub watchdog_interval_ms: u64,
    pub metadata_interval_ms: u64,

    /// Channel labels are cut to this many characters.
    pub label_max_len: usize,
    pub label_prefix: String,

    /// Software volume for PCM sources, 0.0 to 2.0.
    pub volume: f32,

    pub api_base: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            stream_url: String::new(),
            status_url: String::new(),
            guild_id: String::new(),
            channel_id: String::new(),
            bridge_url: "ws://127.0.0.1:2333/voice".to_string(),
            source: SourceMode::Ffmpeg,
            ffmpeg_path: "ffmpeg".to_string(),
            sample_rate: 48000,
            channels: 2,
            bitrate_kbps: 128,
            http_max_retries: 5,
            http_retry_step_ms: 1000,
            http_retry_max_ms: 10_000,
            restart_retry_delay_ms: 5000,
            reacquire_timeout_ms: 5000,
            ready_timeout_ms: 20_000,
            watchdog_interval_ms: 30_000,
            metadata_interval_ms: 5000,
            label_max_len: 100,
            label_prefix: String::new(),
            volume: 1.0,
            api_base: DISCORD_API_BASE.to_string(),
        }
    }
}

impl RelaySettings {
    pub fn destination(&self) -> Destination {
        Destination {
            guild_id: self.guild_id.clone(),
            channel_id: self.channel_id.clone(),
        }
    }

    pub fn decode_config(&self) -> DecodeConfig {
        DecodeConfig {
            binary: self.ffmpeg_path.clone(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            bitrate_kbps: self.bitrate_kbps,
        }
    }

    pub fn http_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http_max_retries,
            step: Duration::from_millis(self.http_retry_step_ms),
            max_delay: Duration::from_millis(self.http_retry_max_ms),
        }
    }

    pub fn connection_timeouts(&self) -> ConnectionTimeouts {
        ConnectionTimeouts {
            ready: Duration::from_millis(self.ready_timeout_ms),
            reacquire: Duration::from_millis(self.reacquire_timeout_ms),
        }
    }

    pub fn restart_retry_delay(&self) -> Duration {
        Duration::from_millis(self.restart_retry_delay_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }

    pub fn metadata_interval(&self) -> Duration {
        Duration::from_millis(self.metadata_interval_ms)
    }

    /// Apply `RELAY_*` environment overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty("RELAY_STREAM_URL") {
            self.stream_url = v;
        }
        if let Some(v) = non_empty("RELAY_STATUS_URL") {
            self.status_url = v;
        }
        if let Some(v) = non_empty("RELAY_GUILD_ID") {
            self.guild_id = v;
        }
        if let Some(v) = non_empty("RELAY_CHANNEL_ID") {
            self.channel_id = v;
        }
        if let Some(v) = non_empty("RELAY_BRIDGE_URL") {
            self.bridge_url = v;
        }
        if let Some(v) = non_empty("RELAY_SOURCE") {
            match v.parse() {
                Ok(mode) => self.source = mode,
                Err(e) => log::warn!("Settings: ignoring RELAY_SOURCE: {}", e),
            }
        }
    }

    /// Check that the relay has somewhere to read from and somewhere to play to.
    pub fn validate(&self) -> Result<(), String> {
        if self.stream_url.trim().is_empty() {
            return Err("stream_url is not set (RELAY_STREAM_URL)".to_string());
        }
        if self.guild_id.trim().is_empty() || self.channel_id.trim().is_empty() {
            return Err("guild_id and channel_id must be set (RELAY_GUILD_ID, RELAY_CHANNEL_ID)".to_string());
        }
        if self.bridge_url.trim().is_empty() {
            return Err("bridge_url is not set (RELAY_BRIDGE_URL)".to_string());
        }
        if self.sample_rate == 0 || self.channels == 0 {
            return Err("sample_rate and channels must be non-zero".to_string());
        }
        if self.ready_timeout_ms == 0 || self.watchdog_interval_ms == 0 || self.metadata_interval_ms == 0 {
            return Err("ready_timeout_ms, watchdog_interval_ms and metadata_interval_ms must be non-zero".to_string());
        }
        if self.label_max_len == 0 {
            return Err("label_max_len must be at least 1".to_string());
        }
        Ok(())
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings_from(path: &Path) -> RelaySettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<RelaySettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                RelaySettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => RelaySettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            RelaySettings::default()
        }
    }
}

/// Settings file (if any) with environment overrides applied.
pub fn load_settings() -> RelaySettings {
    let mut settings = match settings_path() {
        Ok(path) => {
            log::info!("Settings: reading {:?}", path);
            load_settings_from(&path)
        }
        Err(e) => {
            log::warn!("Settings: {}", e);
            RelaySettings::default()
        }
    };
    settings.apply_env();
    settings
}
