//! The scheduling pipeline: pick an offer, bind, handle failures and
//! deletions, and reconcile tasks against external state.

pub mod algorithm;
pub mod binder;
pub mod deleter;
pub mod error_handler;
pub mod reconciler;
pub mod scheduler_loop;
pub mod task_reconciler;

pub use algorithm::{Placement, ScheduleError, SchedulerAlgorithm};
pub use binder::{BindError, Binder};
pub use deleter::Deleter;
pub use error_handler::ErrorHandler;
pub use reconciler::{PodAction, PodReconciler, DEFAULT_RESYNC_INTERVAL};
pub use scheduler_loop::{AttemptOutcome, SchedulerLoop, RECOVERY_DELAY};
pub use task_reconciler::TaskReconciler;
