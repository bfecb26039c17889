//! Retry policy for calls against rate-limited generation services.
//!
//! Backoff is fixed or linear and capped, so the total time a clip can spend
//! retrying stays predictable for the session's progress estimate.

use crate::error::BackendError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay grows by `delay` per retry (delay, 2*delay, ...).
    Linear,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Duration,
    /// Upper bound of a uniformly random extra delay; zero disables it.
    pub jitter: Duration,
    /// Operation name for logging.
    pub operation_name: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay: Duration::from_secs(2),
            backoff: Backoff::Fixed,
            max_delay: Duration::from_secs(10),
            jitter: Duration::ZERO,
            operation_name: "operation".to_string(),
        }
    }
}

impl RetryPolicy {
    pub fn new(operation_name: impl Into<String>) -> Self {
        Self {
            operation_name: operation_name.into(),
            ..Default::default()
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = name.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts a clip may consume, first attempt included.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based), jitter excluded.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Linear => self.delay.saturating_mul(retry.max(1)),
        };
        base.min(self.max_delay)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        let base = self.delay_for_retry(retry);
        if self.jitter.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        base + Duration::from_millis(extra)
    }

    /// Whether a failure after `attempts` attempts deserves another one.
    pub fn should_retry(&self, error: &BackendError, attempts: u32) -> bool {
        error.is_transient() && attempts < self.max_attempts()
    }

    /// Worst-case time spent sleeping between attempts.
    pub fn max_total_backoff(&self) -> Duration {
        (1..=self.max_retries)
            .map(|retry| self.delay_for_retry(retry) + self.jitter)
            .sum()
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, attempts: u32 },
    Failed { error: BackendError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn into_result(self) -> Result<T, BackendError> {
        match self {
            Self::Success { value, .. } => Ok(value),
            Self::Failed { error, .. } => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts the policy.
pub async fn retry_async<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation(attempts).await {
            Ok(value) => return RetryOutcome::Success { value, attempts },
            Err(error) if policy.should_retry(&error, attempts) => {
                let delay = policy.jittered_delay(attempts);
                debug!(
                    operation = %policy.operation_name,
                    attempt = attempts,
                    ?delay,
                    %error,
                    "attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                if error.is_transient() {
                    warn!(
                        operation = %policy.operation_name,
                        attempts,
                        %error,
                        "retries exhausted"
                    );
                }
                return RetryOutcome::Failed { error, attempts };
            }
        }
    }
}
