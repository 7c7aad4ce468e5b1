//! Hands a placement to the transport and records the outcome.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::offers::OfferRegistry;
use crate::operations::Placement;
use quarry_id::TaskId;

use crate::podtask::{RegistryError, Task, TaskRegistry};
use crate::transport::{Binding, Transport, TransportError};

#[derive(Debug, Error)]
pub enum BindError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The task was unregistered (its pod deleted) while the bind was in
    /// progress. Anything already launched has been killed.
    #[error("task {0} was withdrawn during bind")]
    Withdrawn(TaskId),
}

pub struct Binder {
    registry: Arc<TaskRegistry>,
    offers: Arc<OfferRegistry>,
    transport: Arc<dyn Transport>,
}

impl Binder {
    pub fn new(
        registry: Arc<TaskRegistry>,
        offers: Arc<OfferRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            registry,
            offers,
            transport,
        }
    }

    /// Bind the placement's task to its offer's node.
    ///
    /// On success the offer is consumed and the task is launched. On failure
    /// the offer goes back to the pool and the task back to pending. A task
    /// that stops being pending before the transport call is never launched;
    /// one that disappears after it is killed again.
    pub async fn bind(&self, placement: &Placement) -> Result<Task, BindError> {
        let Placement { task, offer } = placement;

        let pending = self
            .registry
            .get(&task.id)
            .await
            .is_some_and(|t| t.is_pending());
        if !pending {
            debug!(task = %task.id, pod = %task.pod_key, "Task withdrawn before bind");
            self.offers.release(&offer.id, &task.id);
            return Err(BindError::Withdrawn(task.id));
        }

        let binding = Binding {
            task_id: task.id,
            pod: task.pod_key.clone(),
            offer_id: offer.id,
            hostname: offer.hostname.clone(),
        };

        if let Err(e) = self.transport.bind(&binding).await {
            warn!(task = %task.id, node = %offer.hostname, error = %e, "Binding rejected");
            self.offers.release(&offer.id, &task.id);
            return match self.registry.update(&task.id, |t| t.reset()).await {
                Err(RegistryError::NotFound(_)) => Err(BindError::Withdrawn(task.id)),
                Err(other) => Err(other.into()),
                Ok(_) => Err(e.into()),
            };
        }

        self.offers.consume(&offer.id, &task.id);
        let launched = match self
            .registry
            .update(&task.id, |t| t.set_launched(offer.id, &offer.hostname))
            .await
        {
            Ok(launched) => launched,
            Err(RegistryError::NotFound(_)) => {
                warn!(task = %task.id, pod = %task.pod_key, "Task withdrawn during bind, killing it");
                if let Err(e) = self.transport.kill(&task.id).await {
                    error!(task = %task.id, error = %e, "Failed to kill withdrawn task");
                }
                return Err(BindError::Withdrawn(task.id));
            }
            Err(e) => return Err(e.into()),
        };
        info!(task = %task.id, pod = %task.pod_key, node = %offer.hostname, "Task launched");
        Ok(launched)
    }

    /// Give back every offer `task` still holds, for an attempt that ended
    /// without reaching bind or its error path.
    pub fn abandon(&self, task: &TaskId) -> usize {
        let released = self.offers.release_task(task);
        if released > 0 {
            debug!(task = %task, released, "Released offers of abandoned attempt");
        }
        released
    }
}
