//! Node registration against the node store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_id::ExecutorId;
use quarry_reconcile::{RetryOutcome, RetryPolicy, Retryable};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

use crate::model::Node;
use crate::node::condition::set_running_executor_condition;
use crate::node::labels::{is_attribute_label, HOSTNAME_LABEL};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NodeStoreError {
    #[error("node {0:?} already exists")]
    AlreadyExists(String),

    #[error("node {0:?} was modified concurrently")]
    Conflict(String),

    #[error("node {0:?} not found")]
    NotFound(String),

    #[error("node store unavailable: {0}")]
    Unavailable(String),
}

impl Retryable for NodeStoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, NodeStoreError::Conflict(_))
    }
}

/// Persistent node records.
///
/// `update` is a compare-and-swap on `resource_version`: a stale version
/// yields [`NodeStoreError::Conflict`].
#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Node, NodeStoreError>;

    async fn create(&self, node: Node) -> Result<Node, NodeStoreError>;

    async fn update(&self, node: Node) -> Result<Node, NodeStoreError>;
}

/// In-memory node store.
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<HashMap<String, Node>>,
    forced_conflicts: AtomicU32,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` updates fail with a conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn list(&self) -> Vec<Node> {
        let mut nodes: Vec<_> = self.nodes.read().await.values().cloned().collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        nodes
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn get(&self, name: &str) -> Result<Node, NodeStoreError> {
        self.nodes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| NodeStoreError::NotFound(name.to_string()))
    }

    async fn create(&self, mut node: Node) -> Result<Node, NodeStoreError> {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.name) {
            return Err(NodeStoreError::AlreadyExists(node.name));
        }
        node.resource_version = 1;
        nodes.insert(node.name.clone(), node.clone());
        Ok(node)
    }

    async fn update(&self, mut node: Node) -> Result<Node, NodeStoreError> {
        if self.take_forced_conflict() {
            return Err(NodeStoreError::Conflict(node.name));
        }
        let mut nodes = self.nodes.write().await;
        let current = nodes
            .get(&node.name)
            .ok_or_else(|| NodeStoreError::NotFound(node.name.clone()))?;
        if current.resource_version != node.resource_version {
            return Err(NodeStoreError::Conflict(node.name));
        }
        node.resource_version += 1;
        nodes.insert(node.name.clone(), node.clone());
        Ok(node)
    }
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("unable to register {hostname:?}: {source}")]
    Register {
        hostname: String,
        #[source]
        source: NodeStoreError,
    },

    #[error("error updating node {hostname:?}: {source}")]
    Update {
        hostname: String,
        #[source]
        source: NodeStoreError,
    },

    #[error("node {hostname:?} still conflicting after {attempts} attempts")]
    ConflictExhausted {
        hostname: String,
        attempts: u32,
        #[source]
        source: NodeStoreError,
    },
}

impl RegistrationError {
    fn from_outcome(hostname: &str, outcome: RetryOutcome<Node, NodeStoreError>) -> Result<Node, Self> {
        match outcome {
            RetryOutcome::Success(node) => Ok(node),
            RetryOutcome::ConflictExhausted { attempts, last } => Err(Self::ConflictExhausted {
                hostname: hostname.to_string(),
                attempts,
                source: last,
            }),
            RetryOutcome::Failed(source) => Err(Self::Update {
                hostname: hostname.to_string(),
                source,
            }),
        }
    }
}

/// Registers agents as nodes and keeps their attribute labels current.
pub struct NodeRegistrar {
    store: Arc<dyn NodeStore>,
    retry: RetryPolicy,
}

impl NodeRegistrar {
    pub fn new(store: Arc<dyn NodeStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Create the node, or update it if it already exists.
    #[instrument(skip(self, attribute_labels, annotations))]
    pub async fn create_or_update(
        &self,
        hostname: &str,
        attribute_labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Node, RegistrationError> {
        let mut node = Node::new(hostname);
        node.labels
            .insert(HOSTNAME_LABEL.to_string(), hostname.to_string());
        node.labels.extend(attribute_labels.clone());
        node.annotations = annotations.clone();

        match self.store.create(node).await {
            Ok(node) => {
                info!(node = %hostname, "Registered node");
                Ok(node)
            }
            Err(NodeStoreError::AlreadyExists(_)) => {
                debug!(node = %hostname, "Node exists, updating");
                self.update(hostname, attribute_labels, annotations).await
            }
            Err(source) => Err(RegistrationError::Register {
                hostname: hostname.to_string(),
                source,
            }),
        }
    }

    /// Replace attribute-derived labels (other labels are kept) and merge
    /// annotations, retrying on conflict.
    pub async fn update(
        &self,
        hostname: &str,
        attribute_labels: &BTreeMap<String, String>,
        annotations: &BTreeMap<String, String>,
    ) -> Result<Node, RegistrationError> {
        let outcome = self
            .retry
            .run(|_| async move {
                let mut node = self.store.get(hostname).await?;
                node.labels.retain(|k, _| !is_attribute_label(k));
                node.labels.extend(attribute_labels.clone());
                node.annotations.extend(annotations.clone());
                self.store.update(node).await
            })
            .await;
        RegistrationError::from_outcome(hostname, outcome)
    }

    /// Refresh the node's running-executor condition, retrying on conflict.
    pub async fn heartbeat(
        &self,
        hostname: &str,
        executor: &ExecutorId,
        now: DateTime<Utc>,
    ) -> Result<Node, RegistrationError> {
        let outcome = self
            .retry
            .run(|_| async move {
                let mut node = self.store.get(hostname).await?;
                set_running_executor_condition(&mut node, executor, now);
                self.store.update(node).await
            })
            .await;
        RegistrationError::from_outcome(hostname, outcome)
    }
}
