//! Pod state store: list, watch, get and delete.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use quarry_id::PodKey;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use crate::model::Pod;

/// Change notification from the store.
#[derive(Debug, Clone, PartialEq)]
pub enum PodEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

impl PodEvent {
    pub fn pod(&self) -> &Pod {
        match self {
            PodEvent::Added(pod) | PodEvent::Modified(pod) | PodEvent::Deleted(pod) => pod,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("pod not found: {0}")]
    NotFound(PodKey),

    #[error("pod store unavailable: {0}")]
    Unavailable(String),
}

/// The cluster's pod records.
///
/// Watch streams may replay events the consumer has already seen; consumers
/// deduplicate on `resource_version`.
#[async_trait]
pub trait PodStore: Send + Sync {
    async fn list(&self) -> Result<Vec<Pod>, StoreError>;

    /// Subscribe to changes made after the call.
    async fn watch(&self) -> Result<mpsc::Receiver<PodEvent>, StoreError>;

    async fn get(&self, key: &PodKey) -> Result<Option<Pod>, StoreError>;

    /// Delete a pod. A zero grace period removes it immediately; otherwise
    /// it is only marked for deletion.
    async fn delete(&self, key: &PodKey, grace_period_secs: u64) -> Result<(), StoreError>;
}

/// In-memory pod store.
#[derive(Debug)]
pub struct MemoryPodStore {
    pods: RwLock<HashMap<PodKey, Pod>>,
    watchers: Mutex<Vec<mpsc::Sender<PodEvent>>>,
    version: AtomicU64,
    backlog: usize,
}

impl MemoryPodStore {
    pub fn new(backlog: usize) -> Self {
        Self {
            pods: RwLock::new(HashMap::new()),
            watchers: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
            backlog: backlog.max(1),
        }
    }

    /// Create or replace a pod, bumping its resource version.
    pub async fn apply(&self, mut pod: Pod) -> Pod {
        pod.resource_version = self.next_version();
        let event = {
            let mut pods = self.pods.write().await;
            match pods.insert(pod.key(), pod.clone()) {
                Some(_) => PodEvent::Modified(pod.clone()),
                None => PodEvent::Added(pod.clone()),
            }
        };
        self.notify(event).await;
        pod
    }

    /// Re-send the current state of a pod without changing it.
    pub async fn replay(&self, key: &PodKey) {
        let pod = self.pods.read().await.get(key).cloned();
        if let Some(pod) = pod {
            self.notify(PodEvent::Modified(pod)).await;
        }
    }

    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn notify(&self, event: PodEvent) {
        let mut watchers = self.watchers.lock().await;
        let mut open = Vec::with_capacity(watchers.len());
        for tx in watchers.drain(..) {
            if tx.send(event.clone()).await.is_ok() {
                open.push(tx);
            }
        }
        *watchers = open;
    }
}

impl Default for MemoryPodStore {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_UPDATES_BACKLOG)
    }
}

#[async_trait]
impl PodStore for MemoryPodStore {
    async fn list(&self) -> Result<Vec<Pod>, StoreError> {
        let mut pods: Vec<_> = self.pods.read().await.values().cloned().collect();
        pods.sort_by_key(|p| p.resource_version);
        Ok(pods)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<PodEvent>, StoreError> {
        let (tx, rx) = mpsc::channel(self.backlog);
        self.watchers.lock().await.push(tx);
        Ok(rx)
    }

    async fn get(&self, key: &PodKey) -> Result<Option<Pod>, StoreError> {
        Ok(self.pods.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &PodKey, grace_period_secs: u64) -> Result<(), StoreError> {
        let event = {
            let mut pods = self.pods.write().await;
            if grace_period_secs == 0 {
                let pod = pods
                    .remove(key)
                    .ok_or_else(|| StoreError::NotFound(key.clone()))?;
                debug!(pod = %key, "Pod removed");
                PodEvent::Deleted(pod)
            } else {
                let pod = pods
                    .get_mut(key)
                    .ok_or_else(|| StoreError::NotFound(key.clone()))?;
                if pod.deletion_timestamp.is_some() {
                    return Ok(());
                }
                pod.deletion_timestamp = Some(Utc::now());
                pod.resource_version = self.next_version();
                PodEvent::Modified(pod.clone())
            }
        };
        self.notify(event).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_apply_emits_added_then_modified() {
        let store = MemoryPodStore::new(8);
        let mut rx = store.watch().await.unwrap();

        let pod = store.apply(Pod::new("foo", "bar")).await;
        assert_eq!(pod.resource_version, 1);
        assert!(matches!(rx.recv().await, Some(PodEvent::Added(p)) if p.resource_version == 1));

        store.apply(pod).await;
        assert!(matches!(rx.recv().await, Some(PodEvent::Modified(p)) if p.resource_version == 2));
    }

    #[tokio::test]
    async fn test_graceful_then_immediate_delete() {
        let store = MemoryPodStore::new(8);
        let key = store.apply(Pod::new("foo", "bar")).await.key();
        let mut rx = store.watch().await.unwrap();

        store.delete(&key, 30).await.unwrap();
        match rx.recv().await {
            Some(PodEvent::Modified(p)) => assert!(p.is_terminating()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(store.get(&key).await.unwrap().is_some());

        store.delete(&key, 0).await.unwrap();
        assert!(matches!(rx.recv().await, Some(PodEvent::Deleted(_))));
        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(
            store.delete(&key, 0).await,
            Err(StoreError::NotFound(key))
        );
    }

    #[tokio::test]
    async fn test_closed_watchers_are_dropped() {
        let store = MemoryPodStore::new(8);
        drop(store.watch().await.unwrap());
        store.apply(Pod::new("foo", "bar")).await;
        assert!(store.watchers.lock().await.is_empty());
    }
}
