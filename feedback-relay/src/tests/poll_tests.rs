use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::errors::RelayError;
use crate::poll::{retry_step, wait_for_condition, with_retries, with_timeout};

#[tokio::test(start_paused = true)]
async fn with_retries_stops_at_first_success() {
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let ok = with_retries(
        move || async move { calls.fetch_add(1, Ordering::SeqCst) + 1 >= 3 },
        10,
        Duration::from_millis(100),
        "third time lucky",
    )
    .await;
    assert!(ok);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn with_retries_makes_n_plus_one_attempts() {
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let ok = with_retries(
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            false
        },
        4,
        Duration::from_millis(100),
        "never",
    )
    .await;
    assert!(!ok);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn retry_step_returns_last_error() {
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let result = retry_step(
        move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err::<bool, _>(RelayError::StaleState(format!("attempt {n}")))
        },
        2,
        Duration::from_millis(10),
        "stale",
    )
    .await;
    assert_eq!(result, Err(RelayError::StaleState("attempt 2".into())));
}

#[tokio::test(start_paused = true)]
async fn retry_step_reports_timeout_when_never_satisfied() {
    let result = retry_step(|| async { false }, 1, Duration::from_millis(10), "pending").await;
    assert!(matches!(result, Err(RelayError::Timeout(_))));
}

#[tokio::test(start_paused = true)]
async fn permanent_error_is_not_retried() {
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let result = retry_step(
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<bool, _>(RelayError::PermissionDenied("storage".into()))
        },
        5,
        Duration::from_millis(10),
        "denied",
    )
    .await;
    assert!(matches!(result, Err(RelayError::PermissionDenied(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn wait_for_condition_is_true_on_first_true() {
    let start = Instant::now();
    assert!(
        wait_for_condition(
            || async { true },
            Duration::from_secs(5),
            Duration::from_millis(500)
        )
        .await
    );
    assert!(start.elapsed() < Duration::from_millis(500));
}

#[tokio::test(start_paused = true)]
async fn wait_for_condition_is_false_once_timeout_elapses() {
    let start = Instant::now();
    let met = wait_for_condition(
        || async { false },
        Duration::from_secs(2),
        Duration::from_millis(500),
    )
    .await;
    assert!(!met);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(2));
    assert!(waited < Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn erroring_predicate_counts_as_false() {
    let calls = AtomicU32::new(0);
    let calls = &calls;
    let met = wait_for_condition(
        move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<bool, _>(RelayError::Platform("boom".into()))
        },
        Duration::from_secs(1),
        Duration::from_millis(250),
    )
    .await;
    assert!(!met);
    assert!(calls.load(Ordering::SeqCst) >= 4);
}

#[tokio::test(start_paused = true)]
async fn with_timeout_reports_timeout() {
    let result = with_timeout(
        tokio::time::sleep(Duration::from_secs(10)),
        Duration::from_secs(1),
        "sleeping",
    )
    .await;
    assert!(matches!(result, Err(RelayError::Timeout(_))));
    assert_eq!(
        with_timeout(async { 7 }, Duration::from_secs(1), "quick").await,
        Ok(7)
    );
}
