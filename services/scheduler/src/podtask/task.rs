//! Tasks: one per pod the scheduler is working on.

use std::fmt;

use chrono::{DateTime, Utc};
use quarry_id::{ExecutorId, OfferId, PodKey, TaskId};
use serde::{Deserialize, Serialize};

use crate::model::Pod;
use crate::resources::{self, CpuCores, MegaBytes};

/// Suffix appended to generated task names.
const TASK_NAME_SUFFIX: &str = "pods";

/// Lifecycle of a task as the scheduler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for an offer.
    Pending,
    /// Bound to an offer and handed to the transport.
    Launched,
    /// Confirmed by an agent heartbeat.
    Running,
    /// Completed or killed.
    Finished,
    /// Heartbeats stopped carrying a usable signal.
    Unknown,
    /// An agent reported a different executor than expected.
    Lost,
}

impl TaskState {
    /// Terminal states free the pod for a fresh task.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Lost)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Launched => "launched",
            TaskState::Running => "running",
            TaskState::Finished => "finished",
            TaskState::Unknown => "unknown",
            TaskState::Lost => "lost",
        };
        write!(f, "{s}")
    }
}

/// `<name>.<namespace>.pods`, with an empty namespace mapped to the default.
pub fn generate_task_name(pod: &Pod) -> String {
    let key = pod.key();
    format!("{}.{}.{}", key.name(), key.namespace(), TASK_NAME_SUFFIX)
}

fn limited(pod: &Pod, default_cpu: CpuCores, default_mem: MegaBytes) -> Pod {
    let mut pod = pod.clone();
    resources::limit_pod_cpu(&mut pod, default_cpu);
    resources::limit_pod_mem(&mut pod, default_mem);
    pod
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub pod_key: PodKey,

    /// Copy of the pod with default limits filled in.
    pub pod: Pod,

    pub state: TaskState,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<OfferId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executor_id: Option<ExecutorId>,

    /// Consecutive failed placement attempts.
    pub attempts: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub launched_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task for `pod`, charging the given defaults to
    /// containers that declare no limits.
    pub fn new(pod: &Pod, default_cpu: CpuCores, default_mem: MegaBytes) -> Self {
        let pod = limited(pod, default_cpu, default_mem);
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            name: generate_task_name(&pod),
            pod_key: pod.key(),
            pod,
            state: TaskState::Pending,
            offer: None,
            hostname: None,
            executor_id: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            launched_at: None,
        }
    }

    /// Replace the task's pod with a newer version of it.
    pub fn refresh_pod(&mut self, pod: &Pod, default_cpu: CpuCores, default_mem: MegaBytes) {
        self.pod = limited(pod, default_cpu, default_mem);
        self.updated_at = Utc::now();
    }

    pub fn cpu(&self) -> CpuCores {
        resources::pod_cpu_limit(&self.pod)
    }

    pub fn mem(&self) -> MegaBytes {
        resources::pod_mem_limit(&self.pod)
    }

    pub fn host_ports(&self) -> Vec<u16> {
        self.pod.host_ports()
    }

    pub fn is_pending(&self) -> bool {
        self.state == TaskState::Pending
    }

    /// Record a successful bind onto `offer` at `hostname`.
    pub fn set_launched(&mut self, offer: OfferId, hostname: &str) {
        let now = Utc::now();
        self.state = TaskState::Launched;
        self.offer = Some(offer);
        self.hostname = Some(hostname.to_string());
        self.attempts = 0;
        self.launched_at = Some(now);
        self.updated_at = now;
    }

    /// Return to pending after a rejected bind.
    pub fn reset(&mut self) {
        self.state = TaskState::Pending;
        self.offer = None;
        self.hostname = None;
        self.launched_at = None;
        self.updated_at = Utc::now();
    }

    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Container;
    use crate::resources::{DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT};
    use rstest::rstest;

    #[rstest]
    #[case("bar", "foo", "foo.bar.pods")]
    #[case("", "foo", "foo.default.pods")]
    #[case("default", "foo", "foo.default.pods")]
    fn test_generate_task_name(#[case] namespace: &str, #[case] name: &str, #[case] want: &str) {
        assert_eq!(generate_task_name(&Pod::new(namespace, name)), want);
    }

    #[test]
    fn test_new_task_applies_defaults() {
        let pod = Pod::new("foo", "bar")
            .with_container(Container::new("a"))
            .with_container(Container::new("b").with_cpu_limit(1.0).with_mem_limit(128.0));
        let task = Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT);

        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.cpu(), CpuCores(1.25));
        assert_eq!(task.mem(), MegaBytes(192.0));
        assert_eq!(task.pod_key, PodKey::new("foo", "bar"));
        assert_eq!(task.name, "bar.foo.pods");
    }

    #[test]
    fn test_launch_and_reset() {
        let pod = Pod::new("foo", "bar").with_container(Container::new("a"));
        let mut task = Task::new(&pod, DEFAULT_CONTAINER_CPU_LIMIT, DEFAULT_CONTAINER_MEM_LIMIT);
        task.attempts = 3;

        let offer = OfferId::new();
        task.set_launched(offer, "n1");
        assert_eq!(task.state, TaskState::Launched);
        assert_eq!(task.offer, Some(offer));
        assert_eq!(task.hostname.as_deref(), Some("n1"));
        assert_eq!(task.attempts, 0);

        task.reset();
        assert!(task.is_pending());
        assert!(task.offer.is_none());
        assert!(task.hostname.is_none());
    }
}
