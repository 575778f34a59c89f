//! Bounded retry with exponential backoff for transient storage failures.

use std::time::Duration;

use crate::error::{Result, StoreError};

const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_MAX_MS: u64 = 10_000;

/// Default attempt budget for remote operations.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

fn backoff(attempt: u32) -> Duration {
    let delay_ms = BACKOFF_BASE_MS.saturating_mul(2u64.pow(attempt.saturating_sub(1)));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

/// Run `operation` up to `max_attempts` times, sleeping between attempts.
///
/// Only transient failures ([`StoreError::is_transient`]) are retried;
/// anything else surfaces immediately.
///
/// # Errors
///
/// Returns the last error once the attempt budget is exhausted.
pub fn with_retries<T>(
    label: &str,
    max_attempts: u32,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = backoff(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Transient storage error, will retry: {err}"
                );
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn succeeds_first_try_without_retry() {
        let calls = AtomicU32::new(0);
        let result = with_retries("get", 4, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retries("put", 4, || {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StoreError::Transient("throttled".into()))
            } else {
                Ok("done")
            }
        });
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn non_transient_surfaces_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("get", 4, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::NotFound("plugins/x".into()))
        });
        assert!(matches!(result, Err(StoreError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attempt_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retries("put", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Transient("flaky".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff(1), Duration::from_millis(250));
        assert_eq!(backoff(2), Duration::from_millis(500));
        assert_eq!(backoff(3), Duration::from_millis(1000));
        assert_eq!(backoff(12), Duration::from_millis(10_000));
    }
}
