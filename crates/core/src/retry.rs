//! Shared retry/backoff policy
//!
//! One policy object governs how individual KV operations are retried
//! under contention or transient failure: exponential backoff with
//! jitter between a floor and ceiling delay, bounded by a hard deadline
//! derived from either the attempt's expiry (attempt-level operations)
//! or a fixed cap (cleanup and heartbeat operations, which must never
//! block indefinitely).
//!
//! Only errors classified transient by `Error::is_transient()` are
//! retried. Definitive conflicts propagate immediately so the attempt,
//! not just the operation, can be retried or aborted.

use crate::error::{Error, Result};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default backoff floor for CAS and KV retries
pub const DEFAULT_RETRY_FLOOR: Duration = Duration::from_millis(1);

/// Default backoff ceiling for CAS and KV retries
pub const DEFAULT_RETRY_CEILING: Duration = Duration::from_millis(100);

/// Default hard cap for operations with no attempt expiry to borrow
/// (cleanup, heartbeat)
pub const DEFAULT_RETRY_CAP: Duration = Duration::from_secs(10);

/// Exponential backoff with jitter and a hard deadline
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Smallest delay between retries
    floor: Duration,
    /// Largest delay between retries
    ceiling: Duration,
    /// Hard deadline after which the last error propagates
    deadline: Option<Instant>,
}

impl RetryPolicy {
    /// Create a policy with explicit floor and ceiling and no deadline
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        Self {
            floor,
            ceiling,
            deadline: None,
        }
    }

    /// Bound this policy by an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Bound this policy by a duration from now
    pub fn bounded_by(self, budget: Duration) -> Self {
        self.with_deadline(Instant::now() + budget)
    }

    /// Policy for operations bounded by an attempt deadline
    pub fn for_attempt(deadline: Instant) -> Self {
        Self::default().with_deadline(deadline)
    }

    /// Policy for cleanup/heartbeat operations, bounded by the fixed cap
    pub fn for_background() -> Self {
        Self::default().bounded_by(DEFAULT_RETRY_CAP)
    }

    /// Whether the hard deadline has passed
    pub fn deadline_passed(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Backoff delay for the given zero-based attempt number
    ///
    /// Exponential growth from the floor, capped at the ceiling, with
    /// half-width jitter so contending clients decorrelate.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self
            .floor
            .saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX))
            .min(self.ceiling);
        let base_ms = base.as_millis().max(1) as u64;
        let jittered = base_ms / 2 + rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
        Duration::from_millis(jittered)
    }

    /// Sleep for the backoff delay of the given attempt number
    ///
    /// Truncated so the sleep never overshoots the deadline.
    pub fn backoff(&self, attempt: u32) {
        let mut delay = self.delay_for(attempt);
        if let Some(deadline) = self.deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            delay = delay.min(remaining);
        }
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
    }

    /// Run an operation, retrying transient failures with backoff
    ///
    /// Returns the operation's result, or the last error once it is
    /// non-transient or the deadline has passed.
    pub fn run<T>(&self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && !self.deadline_passed() => {
                    debug!(operation = what, attempt, error = %e, "retrying transient failure");
                    self.backoff(attempt);
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_FLOOR, DEFAULT_RETRY_CEILING)
    }
}

/// Convenience constructor for the transient timeout error
pub fn transient(message: impl Into<String>) -> Error {
    Error::TransientStore {
        message: message.into(),
    }
}
