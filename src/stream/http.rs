//! Plain HTTP source: the encoded stream body, passed through undecoded
//!
//! A transport error mid-body triggers a bounded series of reconnects with a
//! linear backoff. A clean end of body is passed on as end-of-stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;

use super::{AudioFormat, SourceConnector, SourceStream, StreamError, TransportKind};

/// Connect timeout per request; the body itself is unbounded
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect budget for one outage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub step: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            step: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before reconnect number `attempt` (1-based): `step * attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_delay)
    }
}

pub struct HttpConnector {
    client: Client,
    policy: RetryPolicy,
}

impl HttpConnector {
    pub fn new(policy: RetryPolicy) -> Result<Self, StreamError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StreamError::Http(e.to_string()))?;
        Ok(Self { client, policy })
    }
}

#[async_trait]
impl SourceConnector for HttpConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn connect(&self, url: &str) -> Result<SourceStream, StreamError> {
        let mut state = HttpBody {
            client: self.client.clone(),
            url: url.to_string(),
            policy: self.policy,
            body: None,
            reconnects: 0,
        };

        match request(&state.client, url).await {
            Ok(response) => state.body = Some(Box::pin(response.bytes_stream())),
            Err(err) => state.reconnect(err).await?,
        }
        state.reconnects = 0;

        Ok(SourceStream {
            format: AudioFormat::Passthrough,
            bytes: Box::pin(futures_util::stream::unfold(state, next_chunk)),
        })
    }
}

type Body = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>;

struct HttpBody {
    client: Client,
    url: String,
    policy: RetryPolicy,
    /// `None` once the reconnect budget is spent
    body: Option<Body>,
    /// Reconnects in the current outage; reset when data flows again
    reconnects: u32,
}

impl HttpBody {
    async fn reconnect(&mut self, mut last_error: StreamError) -> Result<(), StreamError> {
        while self.reconnects < self.policy.max_retries {
            self.reconnects += 1;
            let delay = self.policy.delay_for(self.reconnects);
            log::warn!(
                "HTTP stream {}: {} (reconnect {}/{} in {:?})",
                self.url,
                last_error,
                self.reconnects,
                self.policy.max_retries,
                delay
            );
            tokio::time::sleep(delay).await;

            match request(&self.client, &self.url).await {
                Ok(response) => {
                    log::info!("HTTP stream {} reconnected", self.url);
                    self.body = Some(Box::pin(response.bytes_stream()));
                    return Ok(());
                }
                Err(err) => last_error = err,
            }
        }

        self.body = None;
        Err(StreamError::RetriesExhausted {
            attempts: self.reconnects,
            last: last_error.to_string(),
        })
    }
}

async fn request(client: &Client, url: &str) -> Result<reqwest::Response, StreamError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| StreamError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(StreamError::Status(status.as_u16()));
    }
    Ok(response)
}

async fn next_chunk(mut state: HttpBody) -> Option<(Result<Bytes, StreamError>, HttpBody)> {
    loop {
        let body = state.body.as_mut()?;
        match body.next().await {
            Some(Ok(chunk)) => {
                state.reconnects = 0;
                return Some((Ok(chunk), state));
            }
            Some(Err(err)) => {
                if let Err(fatal) = state.reconnect(StreamError::Http(err.to_string())).await {
                    return Some((Err(fatal), state));
                }
            }
            None => return None,
        }
    }
}
