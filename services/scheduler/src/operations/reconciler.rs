//! Re-checks tasks against the pod store.
//!
//! Watch streams can drop events. A periodic resync walks every tracked task
//! and compares it with the store: pods that vanished are deleted, pending
//! pods that fell out of the queue are put back, finished and lost tasks are
//! dropped.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::operations::Deleter;
use crate::podtask::{Task, TaskRegistry};
use crate::queue::SchedulingQueue;
use crate::store::PodStore;

/// Default period between two resyncs.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Outcome of one pod reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodAction {
    /// The pod is gone from the store; the task was handed to the deleter.
    Deleted,
    /// The pod is still waiting for placement and was put back in the queue.
    Requeued,
    /// The task had ended and was removed from the registry.
    Pruned,
    Unchanged,
}

pub struct PodReconciler {
    store: Arc<dyn PodStore>,
    queue: Arc<SchedulingQueue>,
    registry: Arc<TaskRegistry>,
    deleter: Arc<Deleter>,
}

impl PodReconciler {
    pub fn new(
        store: Arc<dyn PodStore>,
        queue: Arc<SchedulingQueue>,
        registry: Arc<TaskRegistry>,
        deleter: Arc<Deleter>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            deleter,
        }
    }

    pub async fn reconcile(&self, task: &Task) -> Result<PodAction> {
        if task.state.is_terminal() {
            self.registry.unregister(&task.id).await;
            debug!(pod = %task.pod_key, task = %task.id, state = %task.state, "Pruned ended task");
            return Ok(PodAction::Pruned);
        }

        let Some(pod) = self.store.get(&task.pod_key).await? else {
            info!(pod = %task.pod_key, task = %task.id, "Pod no longer exists, deleting task");
            self.deleter.delete_one(&task.pod).await?;
            return Ok(PodAction::Deleted);
        };

        if task.is_pending() && !pod.is_assigned() && !pod.is_terminating() {
            if self.queue.enqueue(pod) {
                debug!(pod = %task.pod_key, "Re-offered pending pod");
                return Ok(PodAction::Requeued);
            }
        }
        Ok(PodAction::Unchanged)
    }

    /// Reconcile every tracked task once. Returns how many were acted on.
    pub async fn resync(&self) -> usize {
        let mut acted = 0;
        for task in self.registry.list().await {
            match self.reconcile(&task).await {
                Ok(PodAction::Unchanged) => {}
                Ok(_) => acted += 1,
                Err(e) => warn!(task = %task.id, pod = %task.pod_key, error = %e, "Pod reconcile failed"),
            }
        }
        acted
    }

    /// Resync every `interval` until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting pod resync");
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the store was just listed.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let acted = self.resync().await;
                    if acted > 0 {
                        info!(acted, "Pod resync corrected tasks");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pod resync shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Pod;
    use crate::operations::ErrorHandler;
    use crate::podtask::{TaskRegistry, TaskState};
    use crate::resources::{DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT};
    use crate::store::MemoryPodStore;
    use crate::transport::MockTransport;
    use quarry_id::OfferId;
    use quarry_reconcile::Backoff;
    use std::time::Duration;

    struct Fixture {
        reconciler: PodReconciler,
        store: Arc<MemoryPodStore>,
        queue: Arc<SchedulingQueue>,
        registry: Arc<TaskRegistry>,
        transport: Arc<MockTransport>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryPodStore::new(8));
        let queue = Arc::new(SchedulingQueue::new());
        let registry = Arc::new(TaskRegistry::new());
        let transport = Arc::new(MockTransport::new());
        let errors = Arc::new(ErrorHandler::new(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            registry.clone(),
            queue.clone(),
        ));
        let deleter = Arc::new(Deleter::new(
            queue.clone(),
            registry.clone(),
            transport.clone(),
            errors,
        ));
        Fixture {
            reconciler: PodReconciler::new(store.clone(), queue.clone(), registry.clone(), deleter),
            store,
            queue,
            registry,
            transport,
        }
    }

    #[tokio::test]
    async fn test_vanished_pod_kills_launched_task() {
        let f = fixture();
        let pod = Pod::new("foo", "bar");
        let task = f
            .registry
            .register(Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT))
            .await
            .unwrap();
        let task = f
            .registry
            .update(&task.id, |t| t.set_launched(OfferId::new(), "n1"))
            .await
            .unwrap();

        assert_eq!(f.reconciler.reconcile(&task).await.unwrap(), PodAction::Deleted);
        assert_eq!(f.transport.killed(), vec![task.id]);
        assert!(f.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_pending_pod_is_requeued_once() {
        let f = fixture();
        let pod = f.store.apply(Pod::new("foo", "bar")).await;
        let task = f
            .registry
            .register(Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT))
            .await
            .unwrap();

        assert_eq!(f.reconciler.reconcile(&task).await.unwrap(), PodAction::Requeued);
        assert!(f.queue.contains(&pod.key()));
        assert_eq!(f.reconciler.reconcile(&task).await.unwrap(), PodAction::Unchanged);
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_prunes_ended_tasks() {
        let f = fixture();
        let gone = Pod::new("foo", "gone");
        let task = f
            .registry
            .register(Task::new(&gone, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT))
            .await
            .unwrap();
        f.registry
            .update(&task.id, |t| t.set_state(TaskState::Finished))
            .await
            .unwrap();
        let waiting = f.store.apply(Pod::new("foo", "waiting")).await;
        f.registry
            .register(Task::new(&waiting, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT))
            .await
            .unwrap();

        let lost = f.store.apply(Pod::new("foo", "lost")).await;
        let lost_task = f
            .registry
            .register(Task::new(&lost, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT))
            .await
            .unwrap();
        f.registry
            .update(&lost_task.id, |t| t.set_state(TaskState::Lost))
            .await
            .unwrap();
        assert_eq!(f.registry.len().await, 3);

        assert_eq!(f.reconciler.resync().await, 3);
        assert!(f.queue.contains(&waiting.key()));
        assert!(f.registry.get(&task.id).await.is_none());
        assert!(f.registry.get(&lost_task.id).await.is_none());
        assert_eq!(f.registry.len().await, 1);
        assert!(f.transport.killed().is_empty());
    }

    #[tokio::test]
    async fn test_assigned_pod_is_left_alone() {
        let f = fixture();
        let mut pod = Pod::new("foo", "bar");
        pod.spec.node_name = Some("n1".to_string());
        let pod = f.store.apply(pod).await;
        let task = Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT);

        assert_eq!(f.reconciler.reconcile(&task).await.unwrap(), PodAction::Unchanged);
        assert!(f.queue.is_empty());
    }
}
