//! Bounded retries with exponential backoff.
//!
//! Mutating calls against a resource that another action is still working on
//! fail with conflict or lock errors until that action finishes. [`retry`]
//! re-runs such calls a bounded number of times. Call sites decide which
//! failures are permanent by returning [`AttemptError::Abort`].

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE: u32 = 2;
const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Delay schedule between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
    /// `initial * base^attempt`, capped at `max`.
    Exponential {
        /// Growth factor per attempt.
        base: u32,
        /// Delay after the first failed attempt.
        initial: Duration,
        /// Upper bound for any single delay.
        max: Duration,
    },
    /// The same delay after every failed attempt.
    Fixed(Duration),
}

impl Backoff {
    /// Returns the delay to wait after the failed attempt with the given
    /// zero-based index.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Self::Exponential { base, initial, max } => {
                let factor = base.checked_pow(attempt).unwrap_or(u32::MAX);
                initial.checked_mul(factor).map_or(max, |delay| delay.min(max))
            }
            Self::Fixed(delay) => delay,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: DEFAULT_BASE,
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

/// How often, and how patiently, an operation is retried.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is clamped to at least one.
    #[must_use]
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Creates a policy that retries without sleeping.
    ///
    /// This is primarily used by tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::Fixed(Duration::ZERO))
    }

    /// Returns the maximum number of invocations.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay schedule.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        self.backoff
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, Backoff::default())
    }
}

/// Failure of a single attempt.
///
/// `Abort` is the signal for "stop retrying and surface this error now".
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AttemptError<E> {
    /// The attempt may succeed if repeated.
    Transient(E),
    /// The attempt must not be repeated.
    Abort(E),
}

impl<E> AttemptError<E> {
    /// Marks an error as permanent.
    #[must_use]
    pub const fn abort(err: E) -> Self {
        Self::Abort(err)
    }

    /// Marks an error as retryable.
    #[must_use]
    pub const fn transient(err: E) -> Self {
        Self::Transient(err)
    }

    /// Returns whether this failure stops the retry loop.
    #[must_use]
    pub const fn is_abort(&self) -> bool {
        matches!(self, Self::Abort(_))
    }

    /// Unwraps the underlying error.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Transient(err) | Self::Abort(err) => err,
        }
    }
}

impl<E> From<E> for AttemptError<E> {
    fn from(err: E) -> Self {
        Self::Transient(err)
    }
}

/// Runs `operation` until it succeeds, aborts, or the policy is exhausted.
///
/// Returns the first success, the unwrapped error of an abort, or the error
/// of the final attempt. No delay follows the final attempt.
///
/// # Errors
///
/// Returns the error described above when no attempt succeeds.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AttemptError<E>>>,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        let failed_attempt = attempt;
        attempt = attempt.saturating_add(1);
        match operation().await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Abort(err)) => return Err(err),
            Err(AttemptError::Transient(err)) => {
                if attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.backoff.delay(failed_attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests;
