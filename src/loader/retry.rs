//! Per-record retry policy for failed inserts.

use super::sink::InsertError;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// What a worker should do after an insert attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try the same record again after the given delay.
    Retry(Duration),
    /// Give up on the record and send it to the dead-letter sink.
    Reject,
    /// Stop the whole run.
    Abort,
}

/// How often and how patiently a worker retries a single record.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per record including the first. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Retry errors classified as permanent (constraint violations, bad
    /// data) instead of rejecting them on first sight.
    pub retry_permanent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retry_permanent: false,
        }
    }
}

impl RetryPolicy {
    /// Retry every failure immediately and forever.
    ///
    /// A record that can never be inserted keeps its worker busy and the run
    /// never completes.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
            retry_permanent: true,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(30) as i32;
        let millis =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);

        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Decide what follows failure number `attempts` of a record.
    pub fn decide(&self, error: &InsertError, attempts: u32) -> RetryDecision {
        if error.is_fatal() {
            return RetryDecision::Abort;
        }
        if !error.is_transient() && !self.retry_permanent {
            return RetryDecision::Reject;
        }
        match self.max_attempts {
            Some(max) if attempts >= max => RetryDecision::Reject,
            _ => RetryDecision::Retry(self.delay_for_attempt(attempts)),
        }
    }
}
