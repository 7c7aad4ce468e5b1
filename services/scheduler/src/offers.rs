//! Offers currently available for placement.
//!
//! Claims are exclusive and cover a whole offer: while a task holds a claim
//! no other attempt can see or claim the offer. A claim ends by being
//! consumed (successful bind) or released (failed bind). A claim still held
//! one TTL plus the bind timeout after it was taken is presumed abandoned and
//! the offer expires with it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use quarry_id::{OfferId, TaskId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::model::ResourceOffer;
use crate::node::{attributes_to_labels, NodeRegistrar};
use crate::transport::OfferEvent;

/// How long a claim may be held past the offer TTL before it is dropped.
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OfferError {
    #[error("offer {0} not found")]
    NotFound(OfferId),

    #[error("offer {offer} already claimed by task {task}")]
    AlreadyClaimed { offer: OfferId, task: TaskId },

    #[error("offer {0} expired")]
    Expired(OfferId),
}

#[derive(Debug, Clone)]
struct OfferEntry {
    offer: ResourceOffer,
    seq: u64,
    expires_at: Instant,
    claimed_by: Option<TaskId>,
    claimed_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct OfferState {
    entries: HashMap<OfferId, OfferEntry>,
    next_seq: u64,
}

/// Debug view of one offer.
#[derive(Debug, Clone, Serialize)]
pub struct OfferSummary {
    pub id: OfferId,
    pub hostname: String,
    pub cpus: f64,
    pub mem: f64,
    pub claimed_by: Option<TaskId>,
    pub expires_in_ms: u64,
}

#[derive(Debug)]
pub struct OfferRegistry {
    ttl: Duration,
    bind_timeout: Duration,
    state: Mutex<OfferState>,
}

impl OfferRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            bind_timeout: DEFAULT_BIND_TIMEOUT,
            state: Mutex::new(OfferState::default()),
        }
    }

    pub fn with_bind_timeout(mut self, bind_timeout: Duration) -> Self {
        self.bind_timeout = bind_timeout;
        self
    }

    fn lock(&self) -> MutexGuard<'_, OfferState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn add(&self, offer: ResourceOffer) -> OfferId {
        let id = offer.id;
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            id,
            OfferEntry {
                offer,
                seq,
                expires_at: Instant::now() + self.ttl,
                claimed_by: None,
                claimed_at: None,
            },
        );
        id
    }

    /// Withdraw an offer. Returns false if it was unknown.
    pub fn rescind(&self, id: &OfferId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Drop unclaimed offers past their TTL and claims held past the TTL
    /// plus the bind timeout.
    pub fn expire(&self) -> Vec<OfferId> {
        let now = Instant::now();
        let claim_limit = self.ttl + self.bind_timeout;
        let mut state = self.lock();
        let expired: Vec<_> = state
            .entries
            .iter()
            .filter(|(_, e)| match e.claimed_at {
                None => e.expires_at <= now,
                Some(at) => now.duration_since(at) >= claim_limit,
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            if let Some(entry) = state.entries.remove(id) {
                if let Some(task) = entry.claimed_by {
                    warn!(offer = %id, task = %task, "Dropping offer with abandoned claim");
                }
            }
        }
        expired
    }

    /// Unclaimed, unexpired offers in arrival order.
    pub fn snapshot(&self) -> Vec<ResourceOffer> {
        let now = Instant::now();
        let state = self.lock();
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|e| e.claimed_by.is_none() && e.expires_at > now)
            .collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| e.offer.clone()).collect()
    }

    /// Claim an offer for `task`.
    pub fn claim(&self, id: &OfferId, task: TaskId) -> Result<ResourceOffer, OfferError> {
        let now = Instant::now();
        let mut state = self.lock();
        let entry = state.entries.get_mut(id).ok_or(OfferError::NotFound(*id))?;
        if let Some(holder) = entry.claimed_by {
            return Err(OfferError::AlreadyClaimed {
                offer: *id,
                task: holder,
            });
        }
        if entry.expires_at <= now {
            return Err(OfferError::Expired(*id));
        }
        entry.claimed_by = Some(task);
        entry.claimed_at = Some(now);
        Ok(entry.offer.clone())
    }

    /// Give a claimed offer back to the pool. No-op unless `task` holds it.
    pub fn release(&self, id: &OfferId, task: &TaskId) {
        if let Some(entry) = self.lock().entries.get_mut(id) {
            if entry.claimed_by.as_ref() == Some(task) {
                entry.claimed_by = None;
                entry.claimed_at = None;
            }
        }
    }

    /// Release every offer claimed by `task`. Returns how many were freed.
    pub fn release_task(&self, task: &TaskId) -> usize {
        let mut state = self.lock();
        let mut released = 0;
        for entry in state.entries.values_mut() {
            if entry.claimed_by.as_ref() == Some(task) {
                entry.claimed_by = None;
                entry.claimed_at = None;
                released += 1;
            }
        }
        released
    }

    /// Remove a claimed offer after it was used.
    pub fn consume(&self, id: &OfferId, task: &TaskId) -> Option<ResourceOffer> {
        let mut state = self.lock();
        let held = state
            .entries
            .get(id)
            .is_some_and(|e| e.claimed_by.as_ref() == Some(task));
        if !held {
            return None;
        }
        state.entries.remove(id).map(|e| e.offer)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn summaries(&self) -> Vec<OfferSummary> {
        let now = Instant::now();
        let state = self.lock();
        let mut entries: Vec<_> = state.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
            .into_iter()
            .map(|e| OfferSummary {
                id: e.offer.id,
                hostname: e.offer.hostname.clone(),
                cpus: e.offer.cpus(),
                mem: e.offer.mem(),
                claimed_by: e.claimed_by,
                expires_in_ms: e.expires_at.saturating_duration_since(now).as_millis() as u64,
            })
            .collect()
    }
}

/// Feeds transport offer events into the registry, expires stale offers and
/// registers agents as nodes when their attribute labels change.
///
/// Registration runs on its own tasks so a slow or conflicting node store
/// never holds up offer intake; outstanding registrations are aborted on
/// shutdown.
pub struct OfferFeed {
    offers: Arc<OfferRegistry>,
    registrar: Option<Arc<NodeRegistrar>>,
    known_labels: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
    registrations: JoinSet<()>,
}

impl OfferFeed {
    pub fn new(offers: Arc<OfferRegistry>, registrar: Option<Arc<NodeRegistrar>>) -> Self {
        Self {
            offers,
            registrar,
            known_labels: Arc::new(Mutex::new(HashMap::new())),
            registrations: JoinSet::new(),
        }
    }

    #[instrument(skip_all)]
    pub async fn run(mut self, mut events: mpsc::Receiver<OfferEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(ttl_ms = self.offers.ttl().as_millis() as u64, "Starting offer feed");
        let mut sweep = tokio::time::interval(self.offers.ttl());

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle(event),
                    None => {
                        info!("Offer channel closed");
                        break;
                    }
                },
                Some(_) = self.registrations.join_next(), if !self.registrations.is_empty() => {}
                _ = sweep.tick() => {
                    let expired = self.offers.expire();
                    if !expired.is_empty() {
                        debug!(count = expired.len(), "Expired offers");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Offer feed shutting down");
                        break;
                    }
                }
            }
        }
        self.registrations.shutdown().await;
    }

    fn handle(&mut self, event: OfferEvent) {
        match event {
            OfferEvent::Offered(offer) => {
                self.register_node(&offer);
                let id = self.offers.add(offer);
                debug!(offer = %id, "Offer received");
            }
            OfferEvent::Rescinded(id) => {
                if self.offers.rescind(&id) {
                    debug!(offer = %id, "Offer rescinded");
                }
            }
        }
    }

    fn register_node(&mut self, offer: &ResourceOffer) {
        let Some(registrar) = self.registrar.clone() else {
            return;
        };
        let labels = attributes_to_labels(&offer.attributes);
        {
            let mut known = lock_labels(&self.known_labels);
            if known.get(&offer.hostname) == Some(&labels) {
                return;
            }
            known.insert(offer.hostname.clone(), labels.clone());
        }

        let known_labels = self.known_labels.clone();
        let hostname = offer.hostname.clone();
        self.registrations.spawn(async move {
            if let Err(e) = registrar
                .create_or_update(&hostname, &labels, &BTreeMap::new())
                .await
            {
                warn!(node = %hostname, error = %e, "Node registration failed");
                // Forget the labels so the next offer from this host retries.
                let mut known = lock_labels(&known_labels);
                if known.get(&hostname) == Some(&labels) {
                    known.remove(&hostname);
                }
            }
        });
    }
}

fn lock_labels(
    labels: &Mutex<HashMap<String, BTreeMap<String, String>>>,
) -> MutexGuard<'_, HashMap<String, BTreeMap<String, String>>> {
    labels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
