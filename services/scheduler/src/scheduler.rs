//! Wires the scheduler components together and starts them.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use quarry_events::EventRecorder;
use quarry_reconcile::{Backoff, RetryPolicy};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{self, ApiState};
use crate::config::SchedulerConfig;
use crate::model::Node;
use crate::node::{NodeRegistrar, NodeStore};
use crate::offers::{OfferFeed, OfferRegistry};
use crate::operations::{
    Binder, Deleter, ErrorHandler, PodReconciler, SchedulerAlgorithm, SchedulerLoop, TaskReconciler,
};
use crate::podtask::{PredicateChain, TaskRegistry};
use crate::queue::{PodIngest, SchedulingQueue};
use crate::runtime::{self, StartLatch};
use crate::store::PodStore;
use crate::transport::{OfferEvent, Transport};

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn PodStore>,
    queue: Arc<SchedulingQueue>,
    registry: Arc<TaskRegistry>,
    offers: Arc<OfferRegistry>,
    errors: Arc<ErrorHandler>,
    deleter: Arc<Deleter>,
    pod_reconciler: Arc<PodReconciler>,
    task_reconciler: Arc<TaskReconciler>,
    registrar: Arc<NodeRegistrar>,
    scheduler_loop: Arc<SchedulerLoop>,
    latch: StartLatch,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn PodStore>,
        transport: Arc<dyn Transport>,
        nodes: Arc<dyn NodeStore>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let queue = Arc::new(SchedulingQueue::new());
        let registry = Arc::new(TaskRegistry::new());
        let offers = Arc::new(OfferRegistry::new(config.offer_ttl));
        let errors = Arc::new(ErrorHandler::new(
            Backoff::new(config.initial_pod_backoff, config.max_pod_backoff),
            registry.clone(),
            queue.clone(),
        ));
        let deleter = Arc::new(Deleter::new(
            queue.clone(),
            registry.clone(),
            transport.clone(),
            errors.clone(),
        ));
        let pod_reconciler = Arc::new(PodReconciler::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            deleter.clone(),
        ));
        let task_reconciler = Arc::new(TaskReconciler::new(registry.clone(), recorder.clone()));
        let registrar = Arc::new(NodeRegistrar::new(nodes, RetryPolicy::default()));

        let algorithm = SchedulerAlgorithm::new(
            registry.clone(),
            offers.clone(),
            PredicateChain::default(),
            config.default_container_cpu_limit,
            config.default_container_mem_limit,
        );
        let binder = Binder::new(registry.clone(), offers.clone(), transport);
        let scheduler_loop = Arc::new(SchedulerLoop::new(
            queue.clone(),
            algorithm,
            binder,
            errors.clone(),
            registry.clone(),
            store.clone(),
            recorder,
        ));

        Self {
            config,
            store,
            queue,
            registry,
            offers,
            errors,
            deleter,
            pod_reconciler,
            task_reconciler,
            registrar,
            scheduler_loop,
            latch: StartLatch::new(),
        }
    }

    /// Spawn every component. Consumers wait on the start latch; the
    /// scheduling loop opens it once it is running.
    pub fn start(
        &self,
        offers: mpsc::Receiver<OfferEvent>,
        heartbeats: mpsc::Receiver<Node>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let (deletions_tx, deletions_rx) = mpsc::channel(self.config.updates_backlog);
        let ingest = PodIngest::new(
            self.store.clone(),
            self.queue.clone(),
            self.registry.clone(),
            deletions_tx,
        );
        let feed = OfferFeed::new(self.offers.clone(), Some(self.registrar.clone()));

        let mut handles = vec![
            runtime::on(&self.latch, ingest.run(shutdown.clone())),
            runtime::on(
                &self.latch,
                self.deleter.clone().run(deletions_rx, shutdown.clone()),
            ),
            runtime::on(&self.latch, feed.run(offers, shutdown.clone())),
            runtime::on(
                &self.latch,
                self.task_reconciler.clone().run(heartbeats, shutdown.clone()),
            ),
            runtime::on(
                &self.latch,
                self.pod_reconciler
                    .clone()
                    .run(self.config.resync_interval, shutdown.clone()),
            ),
            runtime::on(
                &self.latch,
                collect_backoff(
                    self.errors.clone(),
                    self.config.max_pod_backoff.saturating_mul(2),
                    shutdown.clone(),
                ),
            ),
        ];

        handles.push(self.scheduler_loop.clone().run(
            &self.latch,
            self.config.recovery_delay,
            shutdown,
        ));
        info!(components = handles.len(), "Scheduler started");
        handles
    }

    pub fn router(&self) -> Router {
        api::create_router(ApiState {
            queue: self.queue.clone(),
            errors: self.errors.clone(),
            registry: self.registry.clone(),
            offers: self.offers.clone(),
            latch: self.latch.clone(),
        })
    }

    pub fn queue(&self) -> &Arc<SchedulingQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn offers(&self) -> &Arc<OfferRegistry> {
        &self.offers
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn latch(&self) -> &StartLatch {
        &self.latch
    }
}

/// Drop stale backoff entries every `period`.
async fn collect_backoff(errors: Arc<ErrorHandler>, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                errors.gc();
                debug!("Collected stale backoff entries");
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
