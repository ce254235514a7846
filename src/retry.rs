use crate::upstream::{NetworkFailure, UpstreamCallError, UpstreamErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

const JITTER_RATIO: f64 = 0.25;

/// Backoff and retry classification for upstream calls made before any
/// response byte has reached the client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries beyond the first attempt.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_retry_statuses")]
    pub retry_statuses: Vec<u16>,
    #[serde(default = "default_retry_network")]
    pub retry_network: Vec<NetworkFailure>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            retry_statuses: default_retry_statuses(),
            retry_network: default_retry_network(),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, err: &UpstreamCallError) -> bool {
        match &err.kind {
            UpstreamErrorKind::Network(failure) => self.retry_network.contains(failure),
            UpstreamErrorKind::Http => err
                .status
                .is_some_and(|status| self.retry_statuses.contains(&status.as_u16())),
            // Headers were already received; output may be in flight.
            UpstreamErrorKind::Stream => false,
            UpstreamErrorKind::Request => false,
        }
    }

    /// `min(max_delay, base_delay * multiplier^attempt)`, attempt 0 being the
    /// first retry.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_multiplier
            .max(0.0)
            .powi(attempt.min(i32::MAX as u32) as i32);
        let raw = self.base_delay_ms as f64 * exp;
        let capped = raw.min(self.max_delay_ms as f64);
        if !capped.is_finite() || capped <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_millis(capped as u64)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = rand::rng().random_range(-JITTER_RATIO..=JITTER_RATIO);
        apply_jitter(self.base_delay(attempt), factor)
    }
}

fn apply_jitter(delay: Duration, factor: f64) -> Duration {
    let millis = delay.as_millis() as f64 * (1.0 + factor);
    if millis <= 0.0 {
        Duration::ZERO
    } else {
        Duration::from_millis(millis.round() as u64)
    }
}

/// Maps a transport error onto the failure classes the policy knows about.
pub fn classify_reqwest_error(err: &reqwest::Error) -> NetworkFailure {
    if err.is_timeout() {
        return NetworkFailure::Timeout;
    }
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::TimedOut => return NetworkFailure::Timeout,
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::BrokenPipe => {
                    return NetworkFailure::Reset;
                }
                std::io::ErrorKind::ConnectionRefused => return NetworkFailure::Refused,
                std::io::ErrorKind::ConnectionAborted => return NetworkFailure::Aborted,
                _ => {}
            }
        }
        let text = cause.to_string();
        if text.contains("dns error") || text.contains("failed to lookup address") {
            return NetworkFailure::Dns;
        }
        source = cause.source();
    }
    if err.is_connect() {
        NetworkFailure::Refused
    } else if err.is_request() || err.is_body() {
        // e.g. the connection closed before a response arrived
        NetworkFailure::Reset
    } else {
        NetworkFailure::Other
    }
}

/// Runs `call` once plus up to `policy.max_attempts` retries. The final error
/// is returned as produced by the last attempt.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, UpstreamCallError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamCallError>>,
{
    let mut attempt: u32 = 0;
    loop {
        metrics::counter!("llmrelay_upstream_attempts_total").increment(1);
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !policy.is_retryable(&err) {
                    if attempt > 0 {
                        tracing::warn!(
                            attempts = attempt + 1,
                            error = %err,
                            "upstream call failed after retries"
                        );
                    }
                    return Err(err);
                }
                let delay = policy.backoff_delay(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    status = ?err.status,
                    error = %err,
                    "retrying upstream call"
                );
                metrics::counter!("llmrelay_upstream_retries_total").increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_retry_statuses() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

fn default_retry_network() -> Vec<NetworkFailure> {
    vec![
        NetworkFailure::Timeout,
        NetworkFailure::Reset,
        NetworkFailure::Refused,
        NetworkFailure::Dns,
        NetworkFailure::Aborted,
    ]
}
