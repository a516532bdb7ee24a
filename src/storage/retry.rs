//! Retry policy for writes that hit SQLite lock contention.
//!
//! A write failing with SQLITE_BUSY / SQLITE_LOCKED is re-submitted after
//! an exponential backoff (`base_delay * 2^attempt`). The wait is a tokio
//! sleep, so a contended tenant never stalls the runtime's worker threads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff parameters for busy/locked writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each one after.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delay after the failed attempt number `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }

    /// Run `op` until it succeeds, fails with a non-busy error, or the
    /// attempt budget is spent.
    ///
    /// # Errors
    ///
    /// Non-busy errors are returned unchanged after the first failure.
    /// Exhaustion surfaces as `Error::RetryExhausted` naming `operation`.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);

        for attempt in 0..attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_busy() => {
                    if attempt + 1 == attempts {
                        break;
                    }
                    let delay = self.delay_for(attempt);
                    debug!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Store busy, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.in_operation(operation)),
            }
        }

        warn!(operation, attempts, "Store still busy, giving up");
        Err(Error::RetryExhausted {
            operation: operation.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> Error {
        Error::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_default_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_succeeds_after_fewer_than_max_busy_failures() {
        for failures in 0..5 {
            let calls = AtomicU32::new(0);
            let result = fast()
                .run("write", || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < failures { Err(busy()) } else { Ok(n) } }
                })
                .await;
            assert_eq!(result.unwrap(), failures);
            assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_after_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .run("upsert_project", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(busy()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(Error::RetryExhausted { operation, attempts }) => {
                assert_eq!(operation, "upsert_project");
                assert_eq!(attempts, 5);
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_busy_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast()
            .run("write", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Validation("bad".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
