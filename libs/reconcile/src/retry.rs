//! Bounded retries against an external store.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::{ReconcileError, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};

/// Errors that can tell a write conflict apart from other failures.
pub trait Retryable {
    /// True if the failed call lost a race with a concurrent writer and may
    /// succeed when repeated.
    fn is_conflict(&self) -> bool;
}

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success(T),

    /// Every attempt ended in a conflict; carries the last error.
    ConflictExhausted { attempts: u32, last: E },

    /// A non-conflict error ended the run early.
    Failed(E),
}

impl<T, E: std::fmt::Display> RetryOutcome<T, E> {
    /// Convert into a [`ReconcileError`]-typed result.
    pub fn into_reconcile(self) -> Result<T, ReconcileError> {
        match self {
            Self::Success(value) => Ok(value),
            Self::ConflictExhausted { attempts, last } => Err(ReconcileError::Conflict {
                attempts,
                message: last.to_string(),
            }),
            Self::Failed(e) => Err(ReconcileError::Internal(e.to_string())),
        }
    }
}

/// Fixed-delay retry policy for conflicting writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Pause between two attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `op` until it succeeds, fails with a non-conflict error, or the
    /// attempt budget is spent. `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> RetryOutcome<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome::Success(value);
                }
                Err(e) if !e.is_conflict() => return RetryOutcome::Failed(e),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return RetryOutcome::ConflictExhausted {
                            attempts: attempt,
                            last: e,
                        };
                    }
                    info!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "Conflicting update, retrying"
                    );
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }
}
