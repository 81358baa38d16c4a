//! Condition polling and fixed-delay retries.
//!
//! Every other component waits through these primitives. Neither of them panics or
//! propagates a check's error: a failing check is just a check that is not yet satisfied.

use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, error, trace, warn};

use crate::errors::RelayError;

/// Interval between condition evaluations unless the caller picks another one.
pub const DEFAULT_POLL_STEP: Duration = Duration::from_millis(500);

/// The result of one check or attempt.
///
/// `Ok(true)` means done, `Ok(false)` means not yet, `Err` means this attempt failed.
pub trait Outcome {
    fn into_outcome(self) -> Result<bool, RelayError>;
}

impl Outcome for bool {
    fn into_outcome(self) -> Result<bool, RelayError> {
        Ok(self)
    }
}

impl Outcome for Result<bool, RelayError> {
    fn into_outcome(self) -> Result<bool, RelayError> {
        self
    }
}

/// Evaluates `predicate` every `step` until it holds or `timeout` has elapsed.
///
/// Returns `true` the first time the predicate holds. The deadline is checked after each
/// evaluation, so the predicate always runs at least once.
pub async fn wait_for_condition<F, Fut, O>(
    mut predicate: F,
    timeout: Duration,
    step: Duration,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = O>,
    O: Outcome,
{
    let start = Instant::now();
    loop {
        match predicate().await.into_outcome() {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => trace!("Condition check failed: {}", e),
        }
        if start.elapsed() > timeout {
            return false;
        }
        sleep(step).await;
    }
}

/// Runs `action` up to `max_retries + 1` times with a fixed `delay` between attempts.
///
/// On exhaustion the error of the last attempt is returned, or a [`RelayError::Timeout`] when
/// the last attempt merely reported "not yet". Permanent errors end the loop at once.
pub async fn retry_step<F, Fut, O>(
    mut action: F,
    max_retries: u32,
    delay: Duration,
    description: &str,
) -> Result<(), RelayError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = O>,
    O: Outcome,
{
    let mut attempts_left = max_retries;
    let mut last_error = None;
    loop {
        match action().await.into_outcome() {
            Ok(true) => return Ok(()),
            Ok(false) => last_error = None,
            Err(e) if e.is_permanent() => {
                error!(function = description, "Attempt failed permanently: {}", e);
                return Err(e);
            }
            Err(e) => {
                debug!(function = description, "Attempt error: {}", e);
                last_error = Some(e);
            }
        }
        warn!("Attempt failed. function: {}", description);
        if attempts_left == 0 {
            break;
        }
        debug!("Retrying... with {} attempts left.", attempts_left);
        attempts_left -= 1;
        sleep(delay).await;
    }
    error!(
        "Failed to execute function: {} after {} retries.",
        description, max_retries
    );
    Err(last_error.unwrap_or_else(|| {
        RelayError::Timeout(format!(
            "{description} not satisfied after {} attempts",
            u64::from(max_retries) + 1
        ))
    }))
}

/// Boolean form of [`retry_step`].
pub async fn with_retries<F, Fut, O>(
    action: F,
    max_retries: u32,
    delay: Duration,
    description: &str,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = O>,
    O: Outcome,
{
    retry_step(action, max_retries, delay, description)
        .await
        .is_ok()
}

/// Races `future` against `duration`.
pub async fn with_timeout<T>(
    future: impl Future<Output = T>,
    duration: Duration,
    what: &str,
) -> Result<T, RelayError> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| RelayError::Timeout(format!("{what} after {duration:?}")))
}
