//! Failed attempts: back off and requeue.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use quarry_id::PodKey;
use quarry_reconcile::{Backoff, BackoffSnapshot};
use tracing::debug;

use crate::model::Pod;
use crate::podtask::TaskRegistry;
use crate::queue::SchedulingQueue;

pub struct ErrorHandler {
    backoff: Mutex<Backoff<PodKey>>,
    registry: Arc<TaskRegistry>,
    queue: Arc<SchedulingQueue>,
}

impl ErrorHandler {
    pub fn new(backoff: Backoff<PodKey>, registry: Arc<TaskRegistry>, queue: Arc<SchedulingQueue>) -> Self {
        Self {
            backoff: Mutex::new(backoff),
            registry,
            queue,
        }
    }

    fn backoff(&self) -> MutexGuard<'_, Backoff<PodKey>> {
        self.backoff.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a failed attempt for `pod`, bump its task's attempt counter and
    /// put it back in the queue behind its backoff delay.
    pub async fn handle(&self, pod: Pod) -> Duration {
        let key = pod.key();
        let (delay, attempts) = {
            let mut backoff = self.backoff();
            let delay = backoff.record_failure(&key);
            (delay, backoff.attempts(&key))
        };

        if let Some(task) = self.registry.for_pod(&key).await {
            if task.is_pending() {
                // The task may have been removed concurrently; nothing to bump then.
                let _ = self.registry.update(&task.id, |t| t.attempts = attempts).await;
            }
        }

        debug!(pod = %key, attempts, delay_ms = delay.as_millis() as u64, "Backing off");
        self.queue.requeue(pod, delay);
        delay
    }

    /// Forget the pod's failure history.
    pub fn clear(&self, key: &PodKey) {
        self.backoff().clear(key);
    }

    pub fn attempts(&self, key: &PodKey) -> u32 {
        self.backoff().attempts(key)
    }

    /// Drop failure history that has gone stale.
    pub fn gc(&self) {
        self.backoff().gc();
    }

    pub fn snapshot(&self) -> Vec<(PodKey, BackoffSnapshot)> {
        let mut entries = self.backoff().snapshot();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::podtask::Task;
    use crate::resources::{DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT};
    use tokio::sync::watch;

    #[tokio::test(start_paused = true)]
    async fn test_handle_backs_off_and_requeues() {
        let registry = Arc::new(TaskRegistry::new());
        let queue = Arc::new(SchedulingQueue::new());
        let handler = ErrorHandler::new(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(4)),
            registry.clone(),
            queue.clone(),
        );
        let pod = Pod::new("foo", "bar");
        let task = registry
            .register(Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT))
            .await
            .unwrap();

        queue.enqueue(pod.clone());
        let (_tx, mut rx) = watch::channel(false);
        let out = queue.yield_pod(&mut rx).await.unwrap();

        assert_eq!(handler.handle(out).await, Duration::from_secs(1));
        assert_eq!(registry.get(&task.id).await.unwrap().attempts, 1);
        assert_eq!(queue.snapshot()[0].ready_in_ms, 1000);

        let out = queue.yield_pod(&mut rx).await.unwrap();
        assert_eq!(handler.handle(out).await, Duration::from_secs(2));
        assert_eq!(registry.get(&task.id).await.unwrap().attempts, 2);

        handler.clear(&pod.key());
        assert_eq!(handler.attempts(&pod.key()), 0);
        assert!(handler.snapshot().is_empty());
    }
}
