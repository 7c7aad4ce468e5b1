//! First-fit placement over the current offers.

use std::sync::Arc;

use quarry_id::PodKey;
use thiserror::Error;
use tracing::debug;

use crate::model::{Pod, ResourceOffer};
use crate::offers::OfferRegistry;
use crate::podtask::{PredicateChain, RegistryError, Task, TaskRegistry, TaskState};
use crate::resources::{CpuCores, MegaBytes};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no suitable offers for pod {0}")]
    NoSuitableOffers(PodKey),

    #[error("task for pod {pod} is {state}, not pending")]
    TaskNotPending { pod: PodKey, state: TaskState },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// A task together with the offer claimed for it.
#[derive(Debug, Clone)]
pub struct Placement {
    pub task: Task,
    pub offer: ResourceOffer,
}

pub struct SchedulerAlgorithm {
    registry: Arc<TaskRegistry>,
    offers: Arc<OfferRegistry>,
    predicates: PredicateChain,
    default_cpu: CpuCores,
    default_mem: MegaBytes,
}

impl SchedulerAlgorithm {
    pub fn new(
        registry: Arc<TaskRegistry>,
        offers: Arc<OfferRegistry>,
        predicates: PredicateChain,
        default_cpu: CpuCores,
        default_mem: MegaBytes,
    ) -> Self {
        Self {
            registry,
            offers,
            predicates,
            default_cpu,
            default_mem,
        }
    }

    /// Find the pod's pending task (creating it if needed) and claim the
    /// first offer that satisfies every predicate.
    pub async fn schedule(&self, pod: &Pod) -> Result<Placement, ScheduleError> {
        let task = self.pending_task(pod).await?;

        for offer in self.offers.snapshot() {
            if !self.predicates.matches(&task, Some(&offer)) {
                continue;
            }
            match self.offers.claim(&offer.id, task.id) {
                Ok(offer) => {
                    debug!(task = %task.id, offer = %offer.id, node = %offer.hostname, "Claimed offer");
                    return Ok(Placement { task, offer });
                }
                Err(e) => debug!(offer = %offer.id, error = %e, "Offer taken, trying next"),
            }
        }

        Err(ScheduleError::NoSuitableOffers(task.pod_key))
    }

    async fn pending_task(&self, pod: &Pod) -> Result<Task, ScheduleError> {
        let key = pod.key();
        match self.registry.for_pod(&key).await {
            Some(task) if task.is_pending() => {
                let (cpu, mem) = (self.default_cpu, self.default_mem);
                Ok(self
                    .registry
                    .update(&task.id, |t| t.refresh_pod(pod, cpu, mem))
                    .await?)
            }
            Some(task) if !task.state.is_terminal() => Err(ScheduleError::TaskNotPending {
                pod: key,
                state: task.state,
            }),
            _ => {
                let task = Task::new(pod, self.default_cpu, self.default_mem);
                Ok(self.registry.register(task).await?)
            }
        }
    }
}
