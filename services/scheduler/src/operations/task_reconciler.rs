//! Reconciles task state against executor heartbeats.
//!
//! Agents report the executor they run through the `RunningExecutor` node
//! condition. Each heartbeat is compared with the tasks launched on that
//! node:
//!
//! - no condition, or an unparseable reason: the task becomes `Unknown`;
//! - the reported executor matches (or the task has none yet and adopts
//!   it): the task is `Running`;
//! - a different executor: the task is `Lost`.
//!
//! Pending and finished tasks are never touched. Heartbeats older than the
//! last one applied for the same node are ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use quarry_events::{EventReason, EventRecorder, ObjectRef};
use quarry_id::{ExecutorId, TaskId};
use quarry_reconcile::{ConvergenceStatus, ReconcileError};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::model::{Node, NodeCondition};
use crate::node::{parse_condition_reason, RUNNING_EXECUTOR};
use crate::podtask::{RegistryError, Task, TaskRegistry, TaskState};

pub struct TaskReconciler {
    registry: Arc<TaskRegistry>,
    recorder: Arc<dyn EventRecorder>,
    last_heartbeat: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// Apply one observation to `task`. Returns the verdict and whether the
/// task was just marked lost.
fn converge(task: &mut Task, observed: Option<&ExecutorId>) -> (ConvergenceStatus, bool) {
    match task.state {
        TaskState::Pending | TaskState::Finished => return (ConvergenceStatus::Converged, false),
        TaskState::Lost => return (ConvergenceStatus::Diverged, false),
        TaskState::Launched | TaskState::Running | TaskState::Unknown => {}
    }

    let Some(observed) = observed else {
        if task.state != TaskState::Unknown {
            task.set_state(TaskState::Unknown);
        }
        return (ConvergenceStatus::Unknown, false);
    };

    match &task.executor_id {
        Some(expected) if expected != observed => {
            task.set_state(TaskState::Lost);
            (ConvergenceStatus::Diverged, true)
        }
        Some(_) => {
            if task.state != TaskState::Running {
                task.set_state(TaskState::Running);
            }
            (ConvergenceStatus::Converged, false)
        }
        None => {
            task.executor_id = Some(observed.clone());
            task.set_state(TaskState::Running);
            (ConvergenceStatus::Converged, false)
        }
    }
}

impl TaskReconciler {
    pub fn new(registry: Arc<TaskRegistry>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            registry,
            recorder,
            last_heartbeat: Mutex::new(HashMap::new()),
        }
    }

    /// Compare `task` with the latest `RunningExecutor` condition of its
    /// node and correct the registry's record. Safe to call repeatedly.
    pub async fn reconcile(
        &self,
        task: &Task,
        condition: Option<&NodeCondition>,
    ) -> Result<ConvergenceStatus, ReconcileError> {
        let observed = condition.and_then(parse_condition_reason);
        if observed.is_none() {
            if let Some(c) = condition {
                debug!(task = %task.id, reason = %c.reason, "Unparseable executor condition");
            }
        }

        let mut verdict = (ConvergenceStatus::Unknown, false);
        let updated = self
            .registry
            .update(&task.id, |t| verdict = converge(t, observed.as_ref()))
            .await
            .map_err(|e| match e {
                RegistryError::NotFound(id) => ReconcileError::NotFound(id.to_string()),
                other => ReconcileError::Internal(other.to_string()),
            })?;

        let (status, lost) = verdict;
        if lost {
            let host = updated.hostname.as_deref().unwrap_or_default();
            warn!(
                task = %updated.id,
                pod = %updated.pod_key,
                node = host,
                expected = ?updated.executor_id,
                observed = ?observed,
                "Task lost: node reports a different executor"
            );
            self.recorder.event(
                ObjectRef::pod(&updated.pod_key),
                EventReason::TaskLost,
                format!(
                    "Task {} lost on {}: node runs executor {}",
                    updated.name,
                    host,
                    observed.as_ref().map(ExecutorId::as_str).unwrap_or_default()
                ),
            );
        }
        Ok(status)
    }

    /// Reconcile every task launched on `node` against its heartbeat.
    ///
    /// Returns nothing for a heartbeat older than one already applied.
    pub async fn reconcile_node(&self, node: &Node) -> Vec<(TaskId, ConvergenceStatus)> {
        let condition = node.condition(RUNNING_EXECUTOR);

        if let Some(c) = condition {
            let mut seen = self
                .last_heartbeat
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let stale = seen
                .get(&node.name)
                .is_some_and(|last| c.last_heartbeat_time < *last);
            if stale {
                debug!(node = %node.name, "Ignoring out-of-order heartbeat");
                return Vec::new();
            }
            seen.insert(node.name.clone(), c.last_heartbeat_time);
        }

        let mut results = Vec::new();
        for task in self.registry.on_host(&node.name).await {
            match self.reconcile(&task, condition).await {
                Ok(status) => results.push((task.id, status)),
                Err(e) => debug!(task = %task.id, error = %e, "Task vanished during reconcile"),
            }
        }
        results
    }

    /// Forget the heartbeat watermark of a node that went away.
    pub fn forget_node(&self, name: &str) {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name);
    }

    /// Consume node heartbeats until shutdown.
    #[instrument(skip_all)]
    pub async fn run(
        self: Arc<Self>,
        mut heartbeats: mpsc::Receiver<Node>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Starting task reconciler");
        loop {
            tokio::select! {
                node = heartbeats.recv() => match node {
                    Some(node) => {
                        let results = self.reconcile_node(&node).await;
                        let diverged = results
                            .iter()
                            .filter(|(_, s)| *s == ConvergenceStatus::Diverged)
                            .count();
                        debug!(node = %node.name, tasks = results.len(), diverged, "Heartbeat reconciled");
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Task reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }
}
