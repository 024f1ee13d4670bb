use std::fmt;
use std::future::Future;

use anyhow::{anyhow, Result};
use rand::Rng;
use tokio::time::{sleep, Duration};

use crate::logging::{obj, v_str, v_u64, warn, Domain};

/// Backoff policy for idempotent ledger reads.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }
}

/// Runs `operation` until it succeeds, fails with a non-transient error, or
/// the retry budget is spent.
pub async fn retry_async<F, Fut, T>(config: &RetryConfig, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_transient(&e) {
                    return Err(e);
                }
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    warn(
                        Domain::Ledger,
                        "retry",
                        obj(&[
                            ("operation", v_str(operation_name)),
                            ("attempt", v_u64(attempt as u64 + 1)),
                            ("max_attempts", v_u64(config.max_retries as u64 + 1)),
                            ("delay_ms", v_u64(delay.as_millis() as u64)),
                            ("error", v_str(&e.to_string())),
                        ]),
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("{} exhausted retries without error", operation_name)))
}

pub fn is_retryable_http_error(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

pub fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Non-success reply from the access node.
#[derive(Debug)]
pub struct HttpStatusError {
    pub status: u16,
    pub body: String,
}

impl fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "access node error ({}): {}", self.status, self.body)
    }
}

impl std::error::Error for HttpStatusError {}

/// Whether another attempt could succeed. Errors that are neither HTTP
/// statuses nor transport failures are assumed transient.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(e) = err.downcast_ref::<HttpStatusError>() {
        return is_retryable_http_error(e.status);
    }
    if let Some(e) = err.downcast_ref::<reqwest::Error>() {
        return is_retryable_network_error(e);
    }
    true
}
