//! Retry with exponential backoff and jitter for transient model errors.

use std::time::Duration;

use tracing::warn;

use crate::model::types::StreamError;

/// How many consecutive throttle errors trigger the fallback-model handler.
pub const PERSISTENT_THROTTLE_COUNT: u32 = 2;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(5_000),
            max_backoff: Duration::from_millis(30_000),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with no sleeping, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }
}

/// Mutable per-send retry bookkeeping.
#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempt: u32,
    backoff: Duration,
    consecutive_throttles: u32,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        let backoff = policy.initial_backoff;
        Self {
            policy,
            attempt: 0,
            backoff,
            consecutive_throttles: 0,
        }
    }

    /// Whether the fallback-model handler should be consulted.
    pub fn throttling_is_persistent(&self) -> bool {
        self.consecutive_throttles >= PERSISTENT_THROTTLE_COUNT
    }

    /// Reset after a model switch so the new model gets a full allowance.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.backoff = self.policy.initial_backoff;
        self.consecutive_throttles = 0;
    }

    /// Records a failed attempt and, when another attempt is allowed, sleeps
    /// the backoff delay and returns true.
    ///
    /// Cancellation and other non-retryable kinds never sleep.
    pub async fn backoff_or_give_up(&mut self, error: &StreamError) -> bool {
        self.attempt += 1;
        if matches!(error.kind, crate::model::types::StreamErrorKind::Throttling) {
            self.consecutive_throttles += 1;
        } else {
            self.consecutive_throttles = 0;
        }

        if !error.is_retryable() || self.attempt >= self.policy.max_attempts {
            return false;
        }

        // A provider-supplied delay hint takes precedence over our schedule.
        let delay = match error.retry_after {
            Some(hint) => hint,
            None => {
                // Jitter: 70%-130% of the current backoff.
                let jitter = 0.7 + rand::random::<f64>() * 0.6;
                Duration::from_secs_f64(self.backoff.as_secs_f64() * jitter)
            },
        };

        warn!(
            attempt = self.attempt,
            max_attempts = self.policy.max_attempts,
            ?delay,
            error = %error,
            "retrying model request after transient error"
        );
        tokio::time::sleep(delay).await;

        if error.retry_after.is_none() {
            self.backoff = Duration::from_secs_f64(
                (self.backoff.as_secs_f64() * self.policy.multiplier).min(self.policy.max_backoff.as_secs_f64()),
            );
        }
        true
    }
}
