//! Retry with exponential backoff for transient failures.
//!
//! Connection establishment and query execution are wrapped in a retry loop
//! with independently configurable policies. Errors are classified with
//! [`ConnectorError::is_transient`]: transient errors are retried while
//! attempts remain, everything else is returned unchanged on first sight.

use crate::constants::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS, JITTER_MAX,
    JITTER_MIN,
};
use crate::error::ConnectorError;
use futures_util::future::BoxFuture;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts. The first attempt counts.
    pub max_retries: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Whether to scale delays by a random factor in `[1.0, 1.2)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Create a retry config with no retries (just execute once).
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    /// Retry config for connection establishment.
    pub fn connection() -> Self {
        Self::default()
    }

    /// Retry config for query execution.
    pub fn query() -> Self {
        Self::default()
    }

    /// Load overrides from `{prefix}_MAX`, `{prefix}_BASE_DELAY_MS` and
    /// `{prefix}_MAX_DELAY_MS`, keeping `base` for anything unset or invalid.
    pub fn from_env(prefix: &str, base: RetryConfig) -> Self {
        let mut config = base;

        if let Ok(max) = std::env::var(format!("{prefix}_MAX")) {
            if let Ok(n) = max.parse::<u32>() {
                config.max_retries = n.max(1);
            }
        }

        if let Ok(delay) = std::env::var(format!("{prefix}_BASE_DELAY_MS")) {
            if let Ok(ms) = delay.parse() {
                config.base_delay = Duration::from_millis(ms);
            }
        }

        if let Ok(delay) = std::env::var(format!("{prefix}_MAX_DELAY_MS")) {
            if let Ok(ms) = delay.parse() {
                config.max_delay = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    ///
    /// `min(max_delay, base_delay * 2^(attempt-1) * jitter)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let mut delay_ms = self.base_delay.as_millis() as f64 * 2f64.powi(exponent);

        if self.jitter {
            delay_ms *= rand::rng().random_range(JITTER_MIN..JITTER_MAX);
        }

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

/// State of one retried invocation.
pub struct RetryContext<'c> {
    config: &'c RetryConfig,
    operation: &'c str,
    attempt: u32,
    classify: fn(&ConnectorError) -> bool,
    started: Instant,
}

impl<'c> RetryContext<'c> {
    /// Start a context that retries errors for which `classify` returns true.
    pub fn new(
        config: &'c RetryConfig,
        operation: &'c str,
        classify: fn(&ConnectorError) -> bool,
    ) -> Self {
        Self {
            config,
            operation,
            attempt: 0,
            classify,
            started: Instant::now(),
        }
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Record the start of an attempt.
    fn begin(&mut self) {
        self.attempt += 1;
    }

    /// Decide whether `error` should be retried, returning the delay to wait.
    pub fn should_retry(&self, error: &ConnectorError) -> Option<Duration> {
        if !(self.classify)(error) {
            debug!(
                operation = self.operation,
                attempt = self.attempt,
                "Non-transient error, not retrying: {}",
                error
            );
            return None;
        }

        if self.attempt >= self.config.max_retries {
            warn!(
                operation = self.operation,
                attempts = self.attempt,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "Retries exhausted: {}",
                error
            );
            return None;
        }

        let delay = self.config.delay_for_attempt(self.attempt);
        warn!(
            operation = self.operation,
            attempt = self.attempt,
            max_retries = self.config.max_retries,
            delay_ms = delay.as_millis() as u64,
            "Transient error, retrying: {}",
            error
        );
        Some(delay)
    }
}

/// Run `fut` under a time limit. A zero limit means no limit.
///
/// Returns `None` when the limit elapses first.
pub async fn within<F: Future>(limit: Duration, fut: F) -> Option<F::Output> {
    if limit.is_zero() {
        Some(fut.await)
    } else {
        timeout(limit, fut).await.ok()
    }
}

/// Execute an async operation with retry logic.
///
/// The operation is re-invoked after a backoff delay while it fails with a
/// transient error and fewer than `max_retries` attempts have been made. The
/// last error is returned unchanged.
///
/// # Example
///
/// ```ignore
/// let client = with_retry(&RetryConfig::connection(), "connect", || {
///     connector.connect(&config)
/// })
/// .await?;
/// ```
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation: &str,
    mut f: F,
) -> Result<T, ConnectorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut ctx = RetryContext::new(config, operation, ConnectorError::is_transient);

    loop {
        ctx.begin();
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => match ctx.should_retry(&e) {
                Some(delay) => sleep(delay).await,
                None => return Err(e),
            },
        }
    }
}

/// Execute an async operation over a borrowed resource with retry logic.
///
/// Same policy as [`with_retry`], for operations that need `&mut` access to
/// state owned by the caller (a connection lease, for instance).
pub async fn with_retry_on<S, F, T>(
    config: &RetryConfig,
    operation: &str,
    state: &mut S,
    mut f: F,
) -> Result<T, ConnectorError>
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, ConnectorError>>,
{
    let mut ctx = RetryContext::new(config, operation, ConnectorError::is_transient);

    loop {
        ctx.begin();
        match f(&mut *state).await {
            Ok(value) => return Ok(value),
            Err(e) => match ctx.should_retry(&e) {
                Some(delay) => sleep(delay).await,
                None => return Err(e),
            },
        }
    }
}
