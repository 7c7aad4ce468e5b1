//! Change-stream adapter: list+watch the pod store and route each pod to
//! the queue or the deleter.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::model::{Pod, PodPhase};
use crate::podtask::TaskRegistry;
use crate::queue::SchedulingQueue;
use crate::store::{PodEvent, PodStore};

/// Where an incoming pod goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Wait for placement (or for the loop's pre-check deletion).
    Queue,
    /// Remove without a bind attempt.
    Delete,
    /// Nothing to do.
    Ignore,
}

/// Decide what to do with an added or modified pod.
pub fn route(pod: &Pod, has_launched_task: bool) -> Route {
    match (pod.is_assigned(), pod.is_terminating()) {
        // Pre-assigned and being deleted before it ever ran: the loop's
        // pre-check removes it from the store.
        (true, true) if pod.phase != PodPhase::Running => Route::Queue,
        (true, _) => Route::Ignore,
        (false, true) => Route::Delete,
        (false, false) if has_launched_task => Route::Ignore,
        (false, false) => Route::Queue,
    }
}

pub struct PodIngest {
    store: Arc<dyn PodStore>,
    queue: Arc<SchedulingQueue>,
    registry: Arc<TaskRegistry>,
    deletions: mpsc::Sender<Pod>,
}

impl PodIngest {
    pub fn new(
        store: Arc<dyn PodStore>,
        queue: Arc<SchedulingQueue>,
        registry: Arc<TaskRegistry>,
        deletions: mpsc::Sender<Pod>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            deletions,
        }
    }

    /// List the store, then follow its watch stream until shutdown.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // Subscribe before listing so nothing falls between the two.
        let mut events = match self.store.watch().await {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "Failed to watch pod store");
                return;
            }
        };

        match self.store.list().await {
            Ok(pods) => {
                info!(count = pods.len(), "Listed pods");
                for pod in pods {
                    self.handle(PodEvent::Added(pod)).await;
                }
            }
            Err(e) => warn!(error = %e, "Failed to list pods"),
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        info!("Pod watch closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pod ingest shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn handle(&self, event: PodEvent) {
        match event {
            PodEvent::Deleted(pod) => self.send_deletion(pod).await,
            PodEvent::Added(pod) | PodEvent::Modified(pod) => {
                let launched = self
                    .registry
                    .for_pod(&pod.key())
                    .await
                    .is_some_and(|t| !t.is_pending() && !t.state.is_terminal());

                match route(&pod, launched) {
                    Route::Queue => {
                        if self.queue.enqueue(pod.clone()) {
                            debug!(pod = %pod.key(), version = pod.resource_version, "Queued pod");
                        }
                    }
                    Route::Delete => self.send_deletion(pod).await,
                    Route::Ignore => {}
                }
            }
        }
    }

    async fn send_deletion(&self, pod: Pod) {
        if self.deletions.send(pod).await.is_err() {
            warn!("Deleter stopped, dropping deletion");
        }
    }
}
