//! The scheduling loop: one pod per iteration, forever.
//!
//! Each iteration takes the next ready pod and walks it through
//! pre-check, placement and binding. Failures are reported as events and
//! sent through the error handler; they never end the loop. A panicking
//! attempt gives back its offers and requeues its pod with backoff, then the
//! panic is absorbed by [`runtime::until`] and followed by
//! [`RECOVERY_DELAY`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;

use quarry_events::{EventReason, EventRecorder, ObjectRef};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::model::{Pod, PodPhase};
use crate::operations::{BindError, Binder, ErrorHandler, ScheduleError, SchedulerAlgorithm};
use crate::podtask::TaskRegistry;
use crate::queue::SchedulingQueue;
use crate::runtime::{self, StartLatch};
use crate::store::PodStore;

/// Pause after a crashed iteration before scheduling resumes.
pub const RECOVERY_DELAY: Duration = Duration::from_millis(100);

/// Result of one scheduling attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Pre-assigned pod marked for deletion was removed from the store.
    Deleted,
    /// Bound to `node`.
    Scheduled { node: String },
    /// No offer fit, or the bind was rejected; requeued after `delay`.
    Failed { delay: Duration },
    /// Nothing to do for this pod.
    Skipped,
}

/// A pod already bound to a node, marked for deletion, that never started
/// running. No agent knows about it, so the scheduler deletes it.
pub fn is_prescheduled_deletion(pod: &Pod) -> bool {
    pod.is_assigned() && pod.is_terminating() && pod.phase != PodPhase::Running
}

pub struct SchedulerLoop {
    queue: Arc<SchedulingQueue>,
    algorithm: SchedulerAlgorithm,
    binder: Binder,
    errors: Arc<ErrorHandler>,
    registry: Arc<TaskRegistry>,
    store: Arc<dyn PodStore>,
    recorder: Arc<dyn EventRecorder>,
}

impl SchedulerLoop {
    pub fn new(
        queue: Arc<SchedulingQueue>,
        algorithm: SchedulerAlgorithm,
        binder: Binder,
        errors: Arc<ErrorHandler>,
        registry: Arc<TaskRegistry>,
        store: Arc<dyn PodStore>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        Self {
            queue,
            algorithm,
            binder,
            errors,
            registry,
            store,
            recorder,
        }
    }

    /// Wait for the next pod and run one attempt on it. `None` on shutdown.
    ///
    /// If the attempt panics the pod is recovered first, then the panic is
    /// resumed for the caller to handle.
    pub async fn schedule_one(&self, shutdown: &mut watch::Receiver<bool>) -> Option<AttemptOutcome> {
        let pod = self.queue.yield_pod(shutdown).await?;
        match AssertUnwindSafe(self.attempt(pod.clone())).catch_unwind().await {
            Ok(outcome) => Some(outcome),
            Err(payload) => {
                self.recover(pod).await;
                panic::resume_unwind(payload)
            }
        }
    }

    /// Undo a crashed attempt: free the offers its task claimed and send the
    /// pod back through the error handler. A task that already launched keeps
    /// its pod out of the queue.
    async fn recover(&self, pod: Pod) {
        let key = pod.key();
        match self.registry.for_pod(&key).await {
            Some(task) if !task.is_pending() && !task.state.is_terminal() => {
                self.binder.abandon(&task.id);
                self.queue.done(&key);
            }
            task => {
                if let Some(task) = task {
                    self.binder.abandon(&task.id);
                }
                let delay = self.errors.handle(pod).await;
                warn!(pod = %key, delay_ms = delay.as_millis() as u64, "Requeued pod of crashed attempt");
            }
        }
    }

    /// Run one attempt on a pod already taken from the queue.
    pub async fn attempt(&self, pod: Pod) -> AttemptOutcome {
        let key = pod.key();

        if is_prescheduled_deletion(&pod) {
            return self.delete_prescheduled(pod).await;
        }
        if pod.is_assigned() || pod.is_terminating() {
            self.queue.done(&key);
            return AttemptOutcome::Skipped;
        }

        debug!(pod = %key, version = pod.resource_version, "Attempting to schedule");
        let placement = match self.algorithm.schedule(&pod).await {
            Ok(placement) => placement,
            Err(ScheduleError::TaskNotPending { state, .. }) => {
                debug!(pod = %key, state = %state, "Task already past pending");
                self.queue.done(&key);
                return AttemptOutcome::Skipped;
            }
            Err(e) => {
                info!(pod = %key, error = %e, "Failed to schedule");
                self.event(&pod, EventReason::FailedScheduling, format!("Error scheduling: {e}"));
                let delay = self.errors.handle(pod).await;
                return AttemptOutcome::Failed { delay };
            }
        };

        let node = placement.offer.hostname.clone();
        if let Err(e) = self.binder.bind(&placement).await {
            if let BindError::Withdrawn(task) = &e {
                debug!(pod = %key, task = %task, "Pod withdrawn while binding");
                self.queue.done(&key);
                return AttemptOutcome::Skipped;
            }
            info!(pod = %key, error = %e, "Failed to bind pod");
            self.event(&pod, EventReason::FailedScheduling, format!("Binding rejected: {e}"));
            let delay = self.errors.handle(pod).await;
            return AttemptOutcome::Failed { delay };
        }

        self.errors.clear(&key);
        self.queue.done(&key);
        self.event(
            &pod,
            EventReason::Scheduled,
            format!("Successfully assigned {} to {}", pod.name, node),
        );
        AttemptOutcome::Scheduled { node }
    }

    async fn delete_prescheduled(&self, pod: Pod) -> AttemptOutcome {
        let key = pod.key();
        info!(pod = %key, "Deleting pre-scheduled, not yet running pod");

        if let Err(e) = self.store.delete(&key, 0).await {
            warn!(pod = %key, error = %e, "Failed to delete pre-scheduled pod");
        }
        if let Some(task) = self.registry.for_pod(&key).await {
            self.registry.unregister(&task.id).await;
        }
        self.errors.clear(&key);
        self.queue.done(&key);
        self.event(&pod, EventReason::Deleted, format!("Deleted pre-scheduled pod {}", pod.name));
        AttemptOutcome::Deleted
    }

    fn event(&self, pod: &Pod, reason: EventReason, message: String) {
        self.recorder.event(ObjectRef::pod(&pod.key()), reason, message);
    }

    /// Start the loop on its own task, then open `latch` so the components
    /// waiting on it can start.
    #[instrument(skip_all)]
    pub fn run(
        self: Arc<Self>,
        latch: &StartLatch,
        recovery_delay: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = self;
        let iteration_shutdown = shutdown.clone();
        let handle = tokio::spawn(runtime::until(
            move || {
                let this = this.clone();
                let mut shutdown = iteration_shutdown.clone();
                async move {
                    this.schedule_one(&mut shutdown).await;
                }
            },
            recovery_delay,
            shutdown,
        ));
        latch.open();
        info!("Scheduler loop started");
        handle
    }
}
