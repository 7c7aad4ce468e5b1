//! Registry of the tasks the scheduler currently tracks.

use std::collections::HashMap;

use quarry_id::{PodKey, TaskId};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::podtask::{Task, TaskState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("pod {pod} already has live task {existing}")]
    AlreadyRegistered { pod: PodKey, existing: TaskId },

    #[error("task not found: {0}")]
    NotFound(TaskId),
}

#[derive(Debug, Default)]
struct RegistryState {
    tasks: HashMap<TaskId, Task>,
    by_pod: HashMap<PodKey, TaskId>,
    /// Registration order; ids minted in the same millisecond do not sort
    /// by creation.
    order: HashMap<TaskId, u64>,
    next_seq: u64,
}

impl RegistryState {
    fn remove(&mut self, id: &TaskId) -> Option<Task> {
        self.order.remove(id);
        self.tasks.remove(id)
    }

    fn sorted<'a>(&self, tasks: impl Iterator<Item = &'a Task>) -> Vec<Task> {
        let mut tasks: Vec<_> = tasks.cloned().collect();
        tasks.sort_by_key(|t| self.order.get(&t.id).copied().unwrap_or(u64::MAX));
        tasks
    }
}

/// Tasks indexed by id and by pod.
///
/// At most one non-terminal task exists per pod. A terminal task is replaced
/// when a new one is registered for the same pod.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    state: RwLock<RegistryState>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task: Task) -> Result<Task, RegistryError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.by_pod.get(&task.pod_key).copied() {
            let live = state
                .tasks
                .get(&existing)
                .is_some_and(|old| !old.state.is_terminal());
            if live {
                return Err(RegistryError::AlreadyRegistered {
                    pod: task.pod_key.clone(),
                    existing,
                });
            }
            state.remove(&existing);
        }

        debug!(task = %task.id, pod = %task.pod_key, "Registered task");
        let seq = state.next_seq;
        state.next_seq += 1;
        state.order.insert(task.id, seq);
        state.by_pod.insert(task.pod_key.clone(), task.id);
        state.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    pub async fn get(&self, id: &TaskId) -> Option<Task> {
        self.state.read().await.tasks.get(id).cloned()
    }

    /// The task currently tracked for `pod`, terminal or not.
    pub async fn for_pod(&self, pod: &PodKey) -> Option<Task> {
        let state = self.state.read().await;
        state
            .by_pod
            .get(pod)
            .and_then(|id| state.tasks.get(id))
            .cloned()
    }

    /// Apply `f` to the task under the write lock and return the result.
    pub async fn update<F>(&self, id: &TaskId, f: F) -> Result<Task, RegistryError>
    where
        F: FnOnce(&mut Task),
    {
        let mut state = self.state.write().await;
        let task = state.tasks.get_mut(id).ok_or(RegistryError::NotFound(*id))?;
        f(task);
        Ok(task.clone())
    }

    pub async fn unregister(&self, id: &TaskId) -> Option<Task> {
        let mut state = self.state.write().await;
        let task = state.remove(id)?;
        if state.by_pod.get(&task.pod_key) == Some(id) {
            state.by_pod.remove(&task.pod_key);
        }
        debug!(task = %id, pod = %task.pod_key, "Unregistered task");
        Some(task)
    }

    /// All tasks in registration order.
    pub async fn list(&self) -> Vec<Task> {
        let state = self.state.read().await;
        state.sorted(state.tasks.values())
    }

    /// Tasks placed on `hostname` that are neither pending nor terminal.
    pub async fn on_host(&self, hostname: &str) -> Vec<Task> {
        let state = self.state.read().await;
        state.sorted(
            state
                .tasks
                .values()
                .filter(|t| t.hostname.as_deref() == Some(hostname))
                .filter(|t| t.state != TaskState::Pending && !t.state.is_terminal()),
        )
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.tasks.is_empty()
    }
}
