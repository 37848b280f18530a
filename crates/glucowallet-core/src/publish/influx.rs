//! InfluxDB v2 write client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tracing::{debug, warn};

use super::{PointSink, PublishPoint, SinkError};

/// Default number of retries after the first failed write.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds between write retries.
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;

/// Ceiling for a single wait between write retries.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(60);

/// Connection parameters for an InfluxDB v2 bucket.
#[derive(Clone)]
pub struct InfluxTarget {
    pub url: String,
    pub org: String,
    pub bucket: String,
    pub token: String,
}

impl std::fmt::Debug for InfluxTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfluxTarget")
            .field("url", &self.url)
            .field("org", &self.org)
            .field("bucket", &self.bucket)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Writes one point per call to `/api/v2/write`, retrying transient
/// failures with bounded exponential backoff.
#[derive(Clone)]
pub struct InfluxSink {
    client: Client,
    target: InfluxTarget,
    max_retries: u32,
    initial_backoff: Duration,
}

impl InfluxSink {
    pub fn new(target: InfluxTarget, timeout: Duration) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            target,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        })
    }

    pub fn with_retries(mut self, max_retries: u32, initial_backoff: Duration) -> Self {
        self.max_retries = max_retries;
        self.initial_backoff = initial_backoff;
        self
    }

    fn write_url(&self) -> String {
        format!("{}/api/v2/write", self.target.url.trim_end_matches('/'))
    }

    async fn try_write(&self, line: &str) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.write_url())
            .query(&[
                ("org", self.target.org.as_str()),
                ("bucket", self.target.bucket.as_str()),
                ("precision", "s"),
            ])
            .header(header::AUTHORIZATION, format!("Token {}", self.target.token))
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line.to_string())
            .send()
            .await
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Err(SinkError::Unavailable(format!("status {}: {}", status, body)))
        } else {
            Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    async fn write(&self, point: &PublishPoint) -> Result<(), SinkError> {
        let line = point.to_line().ok_or(SinkError::EmptyPoint)?;

        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match self.try_write(&line).await {
                Ok(()) => {
                    debug!(line = %line, "Point written");
                    return Ok(());
                }
                Err(SinkError::Unavailable(reason)) => {
                    if retries >= self.max_retries {
                        return Err(SinkError::RetriesExhausted {
                            attempts: retries + 1,
                            last: reason,
                        });
                    }
                    retries += 1;
                    warn!(
                        retry = retries,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        reason = %reason,
                        "InfluxDB write failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = next_backoff(backoff);
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Double the wait, saturating at `MAX_RETRY_BACKOFF`.
fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_RETRY_BACKOFF)
}
