//! Unit tests for the retry controller.

use std::cell::Cell;
use std::time::Duration;

use rstest::rstest;

use super::*;

#[derive(Debug, Eq, PartialEq)]
struct Failure(u32);

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failure #{}", self.0)
    }
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(5)]
#[tokio::test]
async fn exhausting_attempts_returns_last_error(#[case] max_attempts: u32) {
    let calls = Cell::new(0_u32);
    let result: Result<(), Failure> = retry(&RetryPolicy::immediate(max_attempts), || {
        calls.set(calls.get() + 1);
        let call = calls.get();
        async move { Err(AttemptError::transient(Failure(call))) }
    })
    .await;

    assert_eq!(calls.get(), max_attempts);
    assert_eq!(result, Err(Failure(max_attempts)));
}

#[tokio::test]
async fn abort_stops_after_first_invocation() {
    let calls = Cell::new(0_u32);
    let result: Result<(), Failure> = retry(&RetryPolicy::immediate(4), || {
        calls.set(calls.get() + 1);
        async { Err(AttemptError::abort(Failure(7))) }
    })
    .await;

    assert_eq!(calls.get(), 1);
    assert_eq!(result, Err(Failure(7)));
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[tokio::test]
async fn succeeds_after_transient_failures(#[case] failures: u32) {
    let calls = Cell::new(0_u32);
    let result = retry(&RetryPolicy::immediate(4), || {
        calls.set(calls.get() + 1);
        let call = calls.get();
        async move {
            if call <= failures {
                Err(AttemptError::transient(Failure(call)))
            } else {
                Ok(call)
            }
        }
    })
    .await;

    assert_eq!(result, Ok(failures + 1));
    assert_eq!(calls.get(), failures + 1);
}

#[tokio::test]
async fn abort_after_transient_failure_surfaces_abort_error() {
    let calls = Cell::new(0_u32);
    let result: Result<(), Failure> = retry(&RetryPolicy::immediate(5), || {
        calls.set(calls.get() + 1);
        let call = calls.get();
        async move {
            if call == 1 {
                Err(AttemptError::transient(Failure(1)))
            } else {
                Err(AttemptError::abort(Failure(99)))
            }
        }
    })
    .await;

    assert_eq!(calls.get(), 2);
    assert_eq!(result, Err(Failure(99)));
}

#[test]
fn zero_max_attempts_is_clamped_to_one() {
    assert_eq!(RetryPolicy::immediate(0).max_attempts(), 1);
}

#[rstest]
#[case(0, 1)]
#[case(1, 2)]
#[case(2, 4)]
#[case(3, 8)]
fn exponential_backoff_doubles(#[case] attempt: u32, #[case] expected_secs: u64) {
    let backoff = Backoff::default();
    assert_eq!(backoff.delay(attempt), Duration::from_secs(expected_secs));
}

#[test]
fn exponential_backoff_is_capped() {
    let backoff = Backoff::Exponential {
        base: 2,
        initial: Duration::from_secs(1),
        max: Duration::from_secs(10),
    };
    assert_eq!(backoff.delay(4), Duration::from_secs(10));
    assert_eq!(backoff.delay(200), Duration::from_secs(10));
}

#[test]
fn into_inner_unwraps_both_variants() {
    assert_eq!(AttemptError::abort(3).into_inner(), 3);
    assert_eq!(AttemptError::<i32>::from(4).into_inner(), 4);
    assert!(AttemptError::abort(()).is_abort());
    assert!(!AttemptError::transient(()).is_abort());
}
