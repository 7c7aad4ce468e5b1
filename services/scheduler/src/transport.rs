//! Agent transport: binding decisions out, resource offers in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use quarry_id::{ExecutorId, OfferId, PodKey, TaskId};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::model::ResourceOffer;

/// Assignment of a task to the node behind an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Binding {
    pub task_id: TaskId,
    pub pod: PodKey,
    pub offer_id: OfferId,
    pub hostname: String,
}

/// Asynchronous notifications about offers.
#[derive(Debug, Clone)]
pub enum OfferEvent {
    Offered(ResourceOffer),
    Rescinded(OfferId),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("binding rejected: {0}")]
    Rejected(String),

    #[error("offer {0} is no longer valid")]
    OfferGone(OfferId),

    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Launch the task on the offer named in `binding`.
    async fn bind(&self, binding: &Binding) -> Result<(), TransportError>;

    /// Stop a launched task.
    async fn kill(&self, task: &TaskId) -> Result<(), TransportError>;
}

/// In-process transport that records bindings and mints executor ids.
#[derive(Debug, Default)]
pub struct MockTransport {
    fail_binds: AtomicBool,
    bindings: Mutex<Vec<Binding>>,
    executors: Mutex<HashMap<TaskId, ExecutorId>>,
    killed: Mutex<Vec<TaskId>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that rejects every binding.
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.set_failing(true);
        transport
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_binds.store(failing, Ordering::SeqCst);
    }

    pub fn bindings(&self) -> Vec<Binding> {
        lock(&self.bindings).clone()
    }

    /// Executor id minted when `task` was bound.
    pub fn executor_for(&self, task: &TaskId) -> Option<ExecutorId> {
        lock(&self.executors).get(task).cloned()
    }

    pub fn killed(&self) -> Vec<TaskId> {
        lock(&self.killed).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for MockTransport {
    async fn bind(&self, binding: &Binding) -> Result<(), TransportError> {
        if self.fail_binds.load(Ordering::SeqCst) {
            return Err(TransportError::Rejected(
                "mock transport configured to fail".to_string(),
            ));
        }

        let executor = ExecutorId::new(Uuid::new_v4().to_string());
        info!(
            task = %binding.task_id,
            pod = %binding.pod,
            node = %binding.hostname,
            executor = %executor,
            "[MOCK] Launching task"
        );
        lock(&self.executors).insert(binding.task_id, executor);
        lock(&self.bindings).push(binding.clone());
        Ok(())
    }

    async fn kill(&self, task: &TaskId) -> Result<(), TransportError> {
        debug!(task = %task, "[MOCK] Killing task");
        lock(&self.killed).push(*task);
        Ok(())
    }
}
