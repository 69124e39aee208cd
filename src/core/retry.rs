use anyhow::Result;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

/// Exponential backoff applied around every storage call.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_total_tries")]
    pub total_tries: u32,
    #[serde(default = "default_initial_wait_secs")]
    pub initial_wait_secs: f64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_total_tries() -> u32 {
    3
}
fn default_initial_wait_secs() -> f64 {
    3.0
}
fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            total_tries: default_total_tries(),
            initial_wait_secs: default_initial_wait_secs(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryPolicy {
    /// No retries at all. Used by tests and one-shot maintenance commands.
    pub fn none() -> Self {
        Self {
            total_tries: 0,
            initial_wait_secs: 0.0,
            backoff_factor: 1.0,
        }
    }

    /// Wait before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = self.initial_wait_secs * self.backoff_factor.powi(attempt as i32);
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `op`, retrying transient failures with backoff.
    /// Non-transient errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.total_tries => {
                    let wait = self.delay_for(attempt);
                    warn!(
                        "{} failed ({}), retrying in {:.1}s [{}/{}]",
                        label,
                        e,
                        wait.as_secs_f64(),
                        attempt + 1,
                        self.total_tries
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    if attempt > 0 {
                        error!("{} failed after {} retries: {}", label, attempt, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}

/// Backing store temporarily unreachable or contended.
pub fn is_transient(err: &anyhow::Error) -> bool {
    use rusqlite::ErrorCode;
    err.chain().any(|cause| {
        cause
            .downcast_ref::<rusqlite::Error>()
            .and_then(|e| e.sqlite_error_code())
            .is_some_and(|code| {
                matches!(
                    code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
                )
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> anyhow::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        )
        .into()
    }

    fn fast(total_tries: u32) -> RetryPolicy {
        RetryPolicy {
            total_tries,
            initial_wait_secs: 0.001,
            backoff_factor: 2.0,
        }
    }

    #[test]
    fn delay_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(3));
        assert_eq!(policy.delay_for(1), Duration::from_secs(6));
        assert_eq!(policy.delay_for(2), Duration::from_secs(12));
    }

    #[test]
    fn busy_is_transient_but_constraint_is_not() {
        assert!(is_transient(&busy()));
        let constraint: anyhow::Error = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        )
        .into();
        assert!(!is_transient(&constraint));
        assert!(!is_transient(&anyhow::anyhow!("plain")));
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = fast(3)
            .run("op", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_bounded_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(2)
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(busy())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = fast(5)
            .run("op", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("no such table"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
