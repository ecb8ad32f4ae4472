//! Bounded exponential backoff for instrument calls.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use super::error::InstrumentError;

/// How instrument calls are retried after a transient failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always treated as at least 1.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Per-exchange I/O timeout handed to transports.
    pub io_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Start tracking the attempts of one logical call.
    pub fn backoff<'a>(&self, label: &'a str) -> Backoff<'a> {
        Backoff {
            policy: *self,
            label,
            attempt: 1,
            delay: self.initial_backoff,
        }
    }

    fn next_backoff(&self, current: Duration) -> Duration {
        if current.is_zero() {
            return self.max_backoff.min(Duration::from_millis(1));
        }
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Attempt counter for one call. See [`Backoff::retry`].
#[derive(Debug)]
pub struct Backoff<'a> {
    policy: RetryPolicy,
    label: &'a str,
    attempt: u32,
    delay: Duration,
}

impl Backoff<'_> {
    /// Number of the attempt currently being made, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Decide whether the call that just failed with `err` should run again.
    ///
    /// Returns `false` for non-transient errors and once the attempt budget
    /// is spent. Otherwise sleeps for the (jittered) backoff delay first.
    pub async fn retry(&mut self, err: &InstrumentError) -> bool {
        if !err.is_transient() {
            return false;
        }
        if self.attempt >= self.policy.max_attempts.max(1) {
            warn!(
                instrument = self.label,
                attempt = self.attempt,
                error = %err,
                "giving up after retries"
            );
            return false;
        }
        let delay = jittered(self.delay);
        warn!(
            instrument = self.label,
            attempt = self.attempt,
            backoff_ms = delay.as_millis() as u64,
            error = %err,
            "transient instrument error, retrying"
        );
        sleep(delay).await;
        self.delay = self.policy.next_backoff(self.delay);
        self.attempt += 1;
        true
    }
}

/// Scale `delay` by a random factor in [0.9, 1.1] so several instruments
/// failing together do not retry in lockstep.
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.9..=1.1);
    delay.mul_f64(factor)
}
