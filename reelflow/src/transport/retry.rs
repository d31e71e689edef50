//! Exponential-backoff retries shared by every outbound call.
//!
//! Delays start at `base_delay_ms` and double per attempt up to
//! `max_delay_ms`. There is no jitter.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::TransportError;

fn default_max_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![408, 429, 500, 502, 503, 504]
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// HTTP status codes treated as transient.
    #[serde(default = "default_retry_status_codes")]
    pub retry_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            retry_status_codes: default_retry_status_codes(),
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Replaces the retryable status codes.
    #[must_use]
    pub fn with_retry_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.retry_status_codes = codes;
        self
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    /// Returns true if the failure is transient.
    fn is_retryable(&self, retry_status_codes: &[u16]) -> bool;
}

impl Retryable for TransportError {
    fn is_retryable(&self, retry_status_codes: &[u16]) -> bool {
        TransportError::is_retryable(self, retry_status_codes)
    }
}

/// State tracking for one retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Retries performed so far.
    pub attempt: usize,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calculates the delay before the next retry.
    #[must_use]
    pub fn calculate_delay(&self, config: &RetryConfig) -> Duration {
        let exponent = u32::try_from(self.attempt).unwrap_or(u32::MAX);
        let delay = config
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(config.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Returns true if retries are exhausted.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.attempt >= config.max_retries
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No more retries, give up.
    GiveUp,
    /// Don't retry, the error is not retryable.
    NotRetryable,
}

/// Decides whether `error` warrants another attempt, advancing `state`.
#[must_use]
pub fn should_retry<E: Retryable>(
    state: &mut RetryState,
    config: &RetryConfig,
    error: &E,
) -> RetryDecision {
    if !error.is_retryable(&config.retry_status_codes) {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(config) {
        return RetryDecision::GiveUp;
    }
    let delay = state.calculate_delay(config);
    state.attempt += 1;
    RetryDecision::Retry(delay)
}

/// Decorates outbound calls with the shared retry discipline.
#[derive(Debug, Clone, Default)]
pub struct RetryingCaller {
    config: RetryConfig,
}

impl RetryingCaller {
    /// Creates a caller with `config`.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the retry configuration.
    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `operation`, retrying transient failures.
    ///
    /// Non-retryable errors are returned immediately; the last error is
    /// returned once retries are exhausted.
    pub async fn call<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut state = RetryState::new();

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => match should_retry(&mut state, &self.config, &e) {
                    RetryDecision::Retry(delay) => {
                        debug!(
                            call = label,
                            attempt = state.attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %e,
                            "Retrying after error"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    RetryDecision::GiveUp => {
                        warn!(call = label, retries = state.attempt, error = %e, "Retries exhausted");
                        return Err(e);
                    }
                    RetryDecision::NotRetryable => return Err(e),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig::new().with_base_delay_ms(1).with_max_delay_ms(4)
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay_ms, 500);
        assert_eq!(config.max_delay_ms, 8000);
        assert_eq!(config.retry_status_codes, vec![408, 429, 500, 502, 503, 504]);
    }

    #[test]
    fn test_calculate_delay_doubles_and_caps() {
        let config = RetryConfig::new()
            .with_base_delay_ms(500)
            .with_max_delay_ms(8000);
        let mut state = RetryState::new();

        let delays: Vec<u128> = (0..7)
            .map(|attempt| {
                state.attempt = attempt;
                state.calculate_delay(&config).as_millis()
            })
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 8000, 8000, 8000]);
    }

    #[test]
    fn test_should_retry_decisions() {
        let config = RetryConfig::new().with_max_retries(2);
        let mut state = RetryState::new();

        assert!(matches!(
            should_retry(&mut state, &config, &TransportError::Timeout),
            RetryDecision::Retry(_)
        ));
        assert!(matches!(
            should_retry(&mut state, &config, &TransportError::status(503, "")),
            RetryDecision::Retry(_)
        ));
        assert_eq!(
            should_retry(&mut state, &config, &TransportError::Timeout),
            RetryDecision::GiveUp
        );
        assert_eq!(
            should_retry(&mut RetryState::new(), &config, &TransportError::status(404, "")),
            RetryDecision::NotRetryable
        );
    }

    #[tokio::test]
    async fn test_call_success_first_try() {
        let caller = RetryingCaller::new(fast_config());
        let mut calls = 0;

        let result: Result<i32, TransportError> = caller
            .call("test", || {
                calls += 1;
                async { Ok(42) }
            })
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_call_recovers_from_transient_failures() {
        let caller = RetryingCaller::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<&str, TransportError> = caller
            .call("test", || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::status(429, "slow down"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_gives_up_after_max_retries() {
        let caller = RetryingCaller::new(fast_config().with_max_retries(3));
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), TransportError> = caller
            .call("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::Network("reset".into()))
                }
            })
            .await;

        assert_eq!(result, Err(TransportError::Network("reset".into())));
        // Initial attempt plus three retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_call_propagates_non_retryable_immediately() {
        let caller = RetryingCaller::new(fast_config());
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), TransportError> = caller
            .call("test", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TransportError::status(400, "bad prompt"))
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
