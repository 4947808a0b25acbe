//! Retry with exponential backoff.
//!
//! Store calls must never give up: a failed step is retried until the store
//! accepts it, with the delay doubling from one second up to a cap. Sleeping
//! goes through the [`Sleeper`] seam so tests observe the delay sequence
//! without waiting for it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use pulsedb_core::retry::{retry_with, RetryPolicy, ThreadSleeper};
//!
//! let outcome = retry_with(&RetryPolicy::store(), &ThreadSleeper, "pulse_on", || {
//!     store.pulse_on(meter, start)
//! });
//! ```

use std::fmt::Display;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry (default: 1s).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 256s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (default: 0.0).
    pub jitter_percent: f64,
    /// Maximum number of attempts. None = retry forever.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::store()
    }
}

impl RetryPolicy {
    /// Create a new retry policy with the specified parameters.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: Option<u32>,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts,
        }
    }

    /// Policy for store writes: forever, 1s doubling to 256s, no jitter.
    #[must_use]
    pub fn store() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(256),
            backoff_factor: 2.0,
            jitter_percent: 0.0,
            max_attempts: None,
        }
    }

    /// Calculate the delay for a given retry number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // 31 doublings already exceed any sane cap
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// The delay sequence this policy produces, one entry per retry.
    ///
    /// Finite when `max_attempts` is set (one fewer delay than attempts),
    /// unbounded otherwise.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + '_ {
        let retries = self.max_attempts.map(|max| max.saturating_sub(1));
        (0u32..)
            .take_while(move |attempt| retries.is_none_or(|limit| *attempt < limit))
            .map(|attempt| self.delay_for_attempt(attempt))
    }
}

/// Blocking wait used between retries and while a pulse settles.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

/// Sleeps the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested sleeps instead of waiting. Clones share the record.
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    slept: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every duration requested so far, in order.
    #[must_use]
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .map(|slept| slept.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.recorded().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// The result (success or final error).
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent, including delays.
    pub elapsed: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Attempts beyond the first.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted.
///
/// Each failure is logged at `warn` with the attempt number and the delay
/// before the next try.
pub fn retry_with<T, E, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        operation = label,
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);

                if let Some(max) = policy.max_attempts {
                    if attempt >= max {
                        warn!(
                            operation = label,
                            attempt,
                            max_attempts = max,
                            error = %e,
                            "Operation failed after all retry attempts"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                            elapsed: start.elapsed(),
                        };
                    }
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );
                sleeper.sleep(delay);
            }
        }
    }
}
