//! Outbound HTTP for metadata lookups: local throttling, a per-call deadline,
//! and failure classification for the caller's retry policy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{sleep_until, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// 5xx and 429 are worth another attempt; every other status is final.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::Retryable,
            s if s.is_server_error() => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    pub fn for_request_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Delay before retry `n` (0-based) is `base_delay * 2^n`, never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let doublings = u32::try_from(retry).unwrap_or(u32::MAX).min(31);
        self.base_delay
            .checked_mul(1 << doublings)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Deadline for one request/response exchange. Local throttling waits are not counted.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(4),
            user_agent: None,
            global_concurrency: 16,
            token_bucket: None,
        }
    }
}

/// `capacity` requests may go out back to back; after that one every `refill_every`.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    pub fn per_second(per_sec: u32) -> Self {
        let per_sec = per_sec.max(1);
        Self {
            capacity: per_sec,
            refill_every: (Duration::from_secs(1) / per_sec).max(Duration::from_millis(1)),
        }
    }
}

/// Request pacing by reserved send slots. Each caller books the next slot under
/// the lock and then sleeps until it, so waiters are served in arrival order.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    burst: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            interval: config.refill_every,
            burst: config.refill_every * config.capacity.max(1),
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn wait_turn(&self) {
        let send_at = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let booked = (*next_slot).max(now) + self.interval;
            *next_slot = booked;
            booked.checked_sub(self.burst).map_or(now, |t| t.max(now))
        };
        sleep_until(send_at).await;
    }
}

/// Single-attempt HTTP GET. Retrying is the caller's decision, driven by
/// [`FetchError::disposition`].
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    call_timeout: Duration,
    global_limit: Arc<Semaphore>,
    rate_limiter: Option<RateLimiter>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => RetryDisposition::for_request_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map_or(RetryDisposition::NonRetryable, RetryDisposition::for_status),
            Self::Timeout(_) => RetryDisposition::Retryable,
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .connect_timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build().context("building reqwest client")?,
            call_timeout: config.timeout,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            rate_limiter: config.token_bucket.map(RateLimiter::new),
        })
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Waits for a concurrency permit and a rate-limit slot, then runs the
    /// request under `call_timeout`. Only the exchange itself is timed.
    pub async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        if let Some(limiter) = &self.rate_limiter {
            limiter.wait_turn().await;
        }

        tokio::time::timeout(self.call_timeout, self.exchange(url, query))
            .await
            .unwrap_or(Err(FetchError::Timeout(self.call_timeout)))
    }

    async fn exchange(&self, url: &str, query: &[(&str, &str)]) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        debug!(%status, url = %final_url, "http response");

        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_millis(350));
    }

    #[test]
    fn server_errors_throttling_and_timeouts_are_retryable() {
        assert_eq!(
            RetryDisposition::for_status(StatusCode::SERVICE_UNAVAILABLE),
            RetryDisposition::Retryable
        );
        assert_eq!(
            RetryDisposition::for_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            RetryDisposition::for_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        let err = FetchError::HttpStatus {
            status: 502,
            url: "http://example.test".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert_eq!(
            FetchError::Timeout(Duration::from_secs(1)).disposition(),
            RetryDisposition::Retryable
        );
    }

    #[test]
    fn per_second_config_spaces_slots_evenly() {
        let cfg = TokenBucketConfig::per_second(4);
        assert_eq!(cfg.capacity, 4);
        assert_eq!(cfg.refill_every, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn rate_limiter_allows_a_burst_then_paces() {
        let limiter = RateLimiter::new(TokenBucketConfig {
            capacity: 2,
            refill_every: Duration::from_millis(100),
        });
        let started = Instant::now();

        limiter.wait_turn().await;
        limiter.wait_turn().await;
        assert!(started.elapsed() < Duration::from_millis(50));

        limiter.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        limiter.wait_turn().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
