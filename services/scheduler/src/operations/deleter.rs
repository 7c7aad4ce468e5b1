//! Processes pod deletions.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::model::Pod;
use crate::operations::ErrorHandler;
use crate::podtask::{TaskRegistry, TaskState};
use crate::queue::SchedulingQueue;
use crate::transport::Transport;

pub struct Deleter {
    queue: Arc<SchedulingQueue>,
    registry: Arc<TaskRegistry>,
    transport: Arc<dyn Transport>,
    errors: Arc<ErrorHandler>,
}

impl Deleter {
    pub fn new(
        queue: Arc<SchedulingQueue>,
        registry: Arc<TaskRegistry>,
        transport: Arc<dyn Transport>,
        errors: Arc<ErrorHandler>,
    ) -> Self {
        Self {
            queue,
            registry,
            transport,
            errors,
        }
    }

    /// Forget a deleted pod: drop it from the queue, kill a launched task,
    /// and unregister whatever task it had.
    pub async fn delete_one(&self, pod: &Pod) -> Result<()> {
        let key = pod.key();
        if self.queue.remove(&key) {
            debug!(pod = %key, "Removed pod from queue");
        }
        self.errors.clear(&key);

        let Some(task) = self.registry.for_pod(&key).await else {
            return Ok(());
        };

        match task.state {
            TaskState::Pending | TaskState::Finished | TaskState::Lost => {
                self.registry.unregister(&task.id).await;
                debug!(pod = %key, task = %task.id, "Unregistered task");
            }
            TaskState::Launched | TaskState::Running | TaskState::Unknown => {
                self.transport.kill(&task.id).await?;
                self.registry.unregister(&task.id).await;
                info!(pod = %key, task = %task.id, "Killed task of deleted pod");
            }
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, mut deletions: mpsc::Receiver<Pod>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting pod deleter");
        loop {
            tokio::select! {
                pod = deletions.recv() => match pod {
                    Some(pod) => {
                        if let Err(e) = self.delete_one(&pod).await {
                            warn!(pod = %pod.key(), error = %e, "Failed to process deletion");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pod deleter shutting down");
                        break;
                    }
                }
            }
        }
    }
}
