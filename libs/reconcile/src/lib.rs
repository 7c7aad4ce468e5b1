//! Reconciliation primitives.
//!
//! Helpers shared by the scheduler's control loops:
//!
//! - [`Backoff`]: per-key exponential delay applied after failed placements.
//! - [`RetryPolicy`]: bounded retries with a fixed delay for calls against an
//!   external store, returning a typed [`RetryOutcome`].
//! - [`ConvergenceStatus`]: the verdict of comparing in-memory state with
//!   externally observed ground truth.
//!
//! # Invariants
//!
//! - A backoff delay never decreases across consecutive failures of one key
//!   and never exceeds the configured maximum.
//! - Clearing a key (success or removal) restarts it at the initial delay.

mod backoff;
mod retry;

use std::time::Duration;

use thiserror::Error;

pub use backoff::{Backoff, BackoffSnapshot};
pub use retry::{Retryable, RetryOutcome, RetryPolicy};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Conflict detected (concurrent modification) and retries exhausted.
    #[error("conflict after {attempts} attempts: {message}")]
    Conflict { attempts: u32, message: String },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convergence status for a reconciled resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// In-memory state matches the observed state.
    Converged,

    /// Observed state contradicts in-memory state; it was corrected.
    Diverged,

    /// No usable observation (missing or unparseable signal).
    Unknown,
}

/// Default delay before the first retry of a failed placement.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default ceiling for placement backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default attempt budget for conflicting external updates.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default pause between attempts of a conflicting external update.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
