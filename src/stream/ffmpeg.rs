//! ffmpeg-backed source: decode the radio stream to raw PCM on stdout

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::io::ReaderStream;

use super::{AudioFormat, SourceConnector, SourceStream, StreamError, TransportKind};

/// Read size for decoded PCM (about 20 ms of 48 kHz stereo s16le)
const READ_CHUNK: usize = 3840;

/// How ffmpeg decodes the upstream stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeConfig {
    /// ffmpeg binary, resolved through PATH when not absolute
    pub binary: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate_kbps: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            binary: "ffmpeg".to_string(),
            sample_rate: 48000,
            channels: 2,
            bitrate_kbps: 128,
        }
    }
}

impl DecodeConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::S16le {
            sample_rate: self.sample_rate,
            channels: self.channels,
        }
    }
}

/// Arguments for decoding `url` to s16le on stdout.
pub fn ffmpeg_args(url: &str, config: &DecodeConfig) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostdin",
        // ffmpeg handles short upstream blips itself
        "-reconnect",
        "1",
        "-reconnect_streamed",
        "1",
        "-reconnect_delay_max",
        "5",
        "-i",
    ]
    .iter()
    .map(|arg| arg.to_string())
    .collect();

    args.push(url.to_string());
    args.extend([
        "-vn".to_string(),
        "-f".to_string(),
        "s16le".to_string(),
        "-ar".to_string(),
        config.sample_rate.to_string(),
        "-ac".to_string(),
        config.channels.to_string(),
        "-b:a".to_string(),
        format!("{}k", config.bitrate_kbps),
        "pipe:1".to_string(),
    ]);
    args
}

pub struct FfmpegConnector {
    config: DecodeConfig,
}

impl FfmpegConnector {
    pub fn new(config: DecodeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SourceConnector for FfmpegConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Ffmpeg
    }

    async fn connect(&self, url: &str) -> Result<SourceStream, StreamError> {
        let mut child = Command::new(&self.config.binary)
            .args(ffmpeg_args(url, &self.config))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::Spawn(format!("{}: {}", self.config.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::Spawn("ffmpeg stdout was not captured".to_string()))?;

        log::debug!("ffmpeg started (pid {:?})", child.id());

        Ok(SourceStream {
            format: self.config.format(),
            bytes: Box::pin(ChildStream {
                child,
                stdout: ReaderStream::with_capacity(stdout, READ_CHUNK),
            }),
        })
    }
}

/// ffmpeg's stdout as a byte stream. Dropping it kills the process.
struct ChildStream {
    child: Child,
    stdout: ReaderStream<ChildStdout>,
}

impl Stream for ChildStream {
    type Item = Result<Bytes, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stdout)
            .poll_next(cx)
            .map(|item| item.map(|chunk| chunk.map_err(|e| StreamError::Io(e.to_string()))))
    }
}

impl Drop for ChildStream {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            log::debug!("ffmpeg already exited: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_decode_to_pcm_on_stdout() {
        let config = DecodeConfig {
            sample_rate: 44100,
            channels: 1,
            bitrate_kbps: 96,
            ..Default::default()
        };
        let args = ffmpeg_args("https://radio.example/live", &config);

        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "https://radio.example/live");
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));

        let value_of = |flag: &str| {
            let at = args.iter().position(|a| a == flag).unwrap();
            args[at + 1].clone()
        };
        assert_eq!(value_of("-f"), "s16le");
        assert_eq!(value_of("-ar"), "44100");
        assert_eq!(value_of("-ac"), "1");
        assert_eq!(value_of("-b:a"), "96k");
        assert_eq!(value_of("-reconnect"), "1");
        assert_eq!(value_of("-reconnect_streamed"), "1");
    }

    #[test]
    fn reconnect_flags_precede_input() {
        let args = ffmpeg_args("http://x", &DecodeConfig::default());
        let input = args.iter().position(|a| a == "-i").unwrap();
        let reconnect = args.iter().position(|a| a == "-reconnect").unwrap();
        assert!(reconnect < input);
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let connector = FfmpegConnector::new(DecodeConfig {
            binary: "/nonexistent/ffmpeg-binary".to_string(),
            ..Default::default()
        });
        let result = connector.connect("http://x").await;
        assert!(matches!(result, Err(StreamError::Spawn(_))));
    }
}
