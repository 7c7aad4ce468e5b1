//! Scheduling queue: pods waiting for placement.
//!
//! Pods are handed out in arrival order. A requeued pod keeps its place but
//! is not handed out again before its backoff window elapses, so newer
//! arrivals may overtake it. A pod handed out by [`SchedulingQueue::yield_pod`]
//! is in flight until the caller reports [`done`](SchedulingQueue::done) or
//! [`requeue`](SchedulingQueue::requeue); it is never handed out twice at
//! once.

pub mod ingest;

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use quarry_id::PodKey;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::trace;

use crate::model::Pod;

pub use ingest::PodIngest;

#[derive(Debug)]
struct Entry {
    pod: Pod,
    seq: u64,
    not_before: Instant,
}

#[derive(Debug)]
struct InFlight {
    seq: u64,
    version: u64,
    /// Newer version delivered while the pod was out.
    update: Option<Pod>,
    removed: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<PodKey, Entry>,
    in_flight: HashMap<PodKey, InFlight>,
    next_seq: u64,
}

impl QueueState {
    fn take_ready(&mut self, now: Instant) -> Option<Pod> {
        let key = self
            .entries
            .iter()
            .filter(|(_, e)| e.not_before <= now)
            .min_by_key(|(_, e)| e.seq)
            .map(|(k, _)| k.clone())?;
        let entry = self.entries.remove(&key)?;
        self.in_flight.insert(
            key,
            InFlight {
                seq: entry.seq,
                version: entry.pod.resource_version,
                update: None,
                removed: false,
            },
        );
        Some(entry.pod)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.not_before).min()
    }
}

/// Debug view of one queued pod.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntrySnapshot {
    pub pod: PodKey,
    pub resource_version: u64,
    /// Milliseconds until the pod may be handed out again.
    pub ready_in_ms: u64,
}

#[derive(Debug, Default)]
pub struct SchedulingQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SchedulingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add or refresh a pod. Returns false if nothing changed: the same or an
    /// older resource version is already queued or in flight.
    pub fn enqueue(&self, pod: Pod) -> bool {
        let key = pod.key();
        let mut state = self.lock();

        if let Some(flight) = state.in_flight.get_mut(&key) {
            let known = flight
                .update
                .as_ref()
                .map_or(flight.version, |p| p.resource_version);
            if flight.removed || pod.resource_version <= known {
                return false;
            }
            flight.update = Some(pod);
            return true;
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            if pod.resource_version <= entry.pod.resource_version {
                return false;
            }
            entry.pod = pod;
            return true;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            key,
            Entry {
                pod,
                seq,
                not_before: Instant::now(),
            },
        );
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Wait for the next ready pod. Returns `None` once shutdown is signaled.
    pub async fn yield_pod(&self, shutdown: &mut watch::Receiver<bool>) -> Option<Pod> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                if let Some(pod) = state.take_ready(Instant::now()) {
                    trace!(pod = %pod.key(), "Yielding pod");
                    return Some(pod);
                }
                state.next_deadline()
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(deadline) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    /// Return an in-flight pod to the queue, not to be handed out before
    /// `delay` elapses. Dropped if the pod was removed meanwhile.
    pub fn requeue(&self, pod: Pod, delay: Duration) {
        let key = pod.key();
        let mut state = self.lock();
        let (seq, pod) = match state.in_flight.remove(&key) {
            Some(flight) if flight.removed => return,
            Some(flight) => (flight.seq, flight.update.unwrap_or(pod)),
            None => {
                if state.entries.contains_key(&key) {
                    return;
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                (seq, pod)
            }
        };
        state.entries.insert(
            key,
            Entry {
                pod,
                seq,
                not_before: Instant::now() + delay,
            },
        );
        drop(state);
        self.notify.notify_one();
    }

    /// The in-flight pod reached a final outcome.
    pub fn done(&self, key: &PodKey) {
        self.lock().in_flight.remove(key);
    }

    /// Drop a pod. Returns true if it was waiting in the queue.
    pub fn remove(&self, key: &PodKey) -> bool {
        let mut state = self.lock();
        if let Some(flight) = state.in_flight.get_mut(key) {
            flight.removed = true;
        }
        state.entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &PodKey) -> bool {
        let state = self.lock();
        state.entries.contains_key(key) || state.in_flight.contains_key(key)
    }

    /// Pods waiting in the queue (not counting in-flight ones).
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Queued pods in hand-out order (ignoring backoff).
    pub fn snapshot(&self) -> Vec<QueueEntrySnapshot> {
        let now = Instant::now();
        let state = self.lock();
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| QueueEntrySnapshot {
                pod: e.pod.key(),
                resource_version: e.pod.resource_version,
                ready_in_ms: e.not_before.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
