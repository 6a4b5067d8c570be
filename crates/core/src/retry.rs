//! Retry combinator for remote calls.
//!
//! Retryable: timeouts, connection failures, HTTP 429 and 5xx. Everything else (other 4xx,
//! malformed payloads) fails on the first attempt.

use futures::future::join_all;
use rand::Rng;
use reqwest::StatusCode;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed upstream record: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Fatal,
}

impl FetchError {
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        FetchError::Http {
            status: status.as_u16(),
            body: body.into(),
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            FetchError::from_status(status, err.to_string())
        } else {
            FetchError::Connection(err.to_string())
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Timeout | FetchError::Connection(_) => RetryDisposition::Retryable,
            FetchError::Http { status, .. } => {
                if *status == 429 || (500..600).contains(status) {
                    RetryDisposition::Retryable
                } else {
                    RetryDisposition::Fatal
                }
            }
            FetchError::Malformed(_) => RetryDisposition::Fatal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Http { status: 404, .. })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound of the uniform random jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// `min(base_delay * backoff_multiplier^attempt + jitter, max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32, jitter: Duration) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exp);
        let total = scaled + jitter.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let ms = if total.is_nan() {
            max_ms
        } else {
            total.clamp(0.0, max_ms)
        };
        Duration::from_millis(ms as u64)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.delay_for_attempt(attempt, jitter)
    }
}

/// Runs `operation` until it succeeds, fails fatally, or exhausts `policy.max_retries`.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut attempt: u32 = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.disposition() == RetryDisposition::Fatal {
            return Err(err);
        }

        if attempt >= policy.max_retries {
            tracing::warn!(
                label,
                attempts = attempt + 1,
                error = %err,
                "retries exhausted"
            );
            return Err(err);
        }

        let backoff = policy.backoff_delay(attempt);
        tracing::debug!(
            label,
            attempt = attempt + 1,
            ?backoff,
            error = %err,
            "retryable failure; backing off"
        );
        tokio::time::sleep(backoff).await;
        attempt += 1;
    }
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<(String, T)>,
    pub failed: Vec<(String, FetchError)>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Fraction of items that succeeded; `0.0` when nothing was attempted.
    pub fn success_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.succeeded.len() as f64 / total as f64
    }

    pub fn extend(&mut self, other: BatchOutcome<T>) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}

/// Applies [`execute`] independently to every ticker, concurrently, and partitions the results.
pub async fn execute_batch<T, F, Fut>(
    policy: &RetryPolicy,
    tickers: &[String],
    operation: F,
) -> BatchOutcome<T>
where
    F: Fn(String) -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let operation = &operation;
    let attempts = tickers.iter().map(|ticker| async move {
        let res = execute(policy, ticker, || operation(ticker.clone())).await;
        (ticker.clone(), res)
    });

    let mut outcome = BatchOutcome::default();
    for (ticker, res) in join_all(attempts).await {
        match res {
            Ok(value) => outcome.succeeded.push((ticker, value)),
            Err(err) => {
                if err.is_not_found() {
                    tracing::info!(%ticker, error = %err, "ticker not found upstream");
                } else {
                    tracing::warn!(%ticker, error = %err, "ticker fetch failed");
                }
                outcome.failed.push((ticker, err));
            }
        }
    }
    outcome
}
