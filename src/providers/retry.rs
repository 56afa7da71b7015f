//! Retry policy for model calls.
//!
//! Only transient failures are retried (see [`ProviderError::is_transient`]).
//! A 429 answer waits at least as long as the server's `Retry-After`.

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::errors::ProviderError;

/// Jittered exponential backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    /// 1s, 2s, 4s... capped at 30s, three retries.
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(self.max_retries)
    }
}

/// Stretch the backoff delay up to the server's `Retry-After` on a 429.
///
/// Matches `backon::Retry::adjust`: `None` means retries are exhausted and
/// stays `None`.
pub fn adjust_for_rate_limit(err: &ProviderError, dur: Option<Duration>) -> Option<Duration> {
    match (err, dur) {
        (ProviderError::RateLimited { retry_after_ms, .. }, Some(d)) => {
            Some(d.max(Duration::from_millis(*retry_after_ms)))
        }
        (_, dur) => dur,
    }
}
