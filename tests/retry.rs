//! Retry Integration Tests
//!
//! Attempt counting and backoff behavior of the retry executor.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use faceless::core::{RetryExecutor, RetryPolicy};
use tokio_test::{assert_err, assert_ok};

fn policy(max_retries: u32, initial_delay_ms: u64) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay_ms,
        exponential: true,
        max_delay_ms: 1000,
    }
}

#[tokio::test]
async fn test_always_failing_exhausts_attempts() {
    let executor = RetryExecutor::new(policy(3, 1));
    let calls = AtomicU32::new(0);

    let result = executor
        .run(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<(), String>(format!("attempt {} failed", n)) }
        })
        .await;

    let exhausted = assert_err!(result);
    assert_eq!(exhausted.attempts, 4);
    assert_eq!(exhausted.last_error, "attempt 4 failed");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_success_stops_retrying() {
    let executor = RetryExecutor::new(policy(3, 1));
    let calls = AtomicU32::new(0);

    let result = executor
        .run(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n * 10)
                }
            }
        })
        .await;

    let value = assert_ok!(result);

    assert_eq!(value, 20);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_zero_retries_means_single_attempt() {
    let executor = RetryExecutor::new(policy(0, 1));
    let calls = AtomicU32::new(0);

    let exhausted = executor
        .run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), &str>("nope") }
        })
        .await
        .unwrap_err();

    assert_eq!(exhausted.attempts, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_observer_sees_every_failure() {
    let executor = RetryExecutor::new(policy(2, 1));
    let mut seen = Vec::new();

    let _ = executor
        .run_observed(
            || async { Err::<(), &str>("down") },
            |failure| seen.push((failure.attempt, failure.next_delay)),
        )
        .await;

    assert_eq!(
        seen,
        vec![
            (1, Some(Duration::from_millis(1))),
            (2, Some(Duration::from_millis(2))),
            (3, None),
        ]
    );
}

#[tokio::test]
async fn test_backoff_sleeps_between_attempts() {
    let executor = RetryExecutor::new(policy(2, 20));
    let started = Instant::now();

    let _ = executor.run(|| async { Err::<(), &str>("slow") }).await;

    // 20ms then 40ms
    assert!(started.elapsed() >= Duration::from_millis(60));
}
