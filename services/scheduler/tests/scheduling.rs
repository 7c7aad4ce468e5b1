//! End-to-end tests of the scheduler wired against in-memory collaborators.
//!
//! Each test starts the full component set (ingest, offer feed, deleter,
//! reconcilers, scheduling loop) and drives it through the pod store, the
//! offer channel and the heartbeat channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use quarry_events::{EventReason, MemoryRecorder, ObjectRef};
use quarry_id::{ExecutorId, TaskId};
use quarry_scheduler::config::SchedulerConfig;
use quarry_scheduler::model::{Attribute, Container, Node, Pod, PodPhase, ResourceOffer};
use quarry_scheduler::node::{set_running_executor_condition, MemoryNodeStore, HOSTNAME_LABEL};
use quarry_scheduler::podtask::TaskState;
use quarry_scheduler::store::{MemoryPodStore, PodStore};
use quarry_scheduler::transport::{Binding, MockTransport, OfferEvent, Transport, TransportError};
use quarry_scheduler::Scheduler;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tower::ServiceExt;

/// Poll a condition (which may `.await`) until it holds, failing the test
/// after a few seconds.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut met = false;
        for _ in 0..500 {
            if $cond {
                met = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(met, "condition not met in time: {}", stringify!($cond));
    }};
}

struct Harness {
    scheduler: Scheduler,
    store: Arc<MemoryPodStore>,
    nodes: Arc<MemoryNodeStore>,
    recorder: Arc<MemoryRecorder>,
    offers: mpsc::Sender<OfferEvent>,
    heartbeats: mpsc::Sender<Node>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Harness {
    fn start(transport: Arc<dyn Transport>) -> Self {
        let store = Arc::new(MemoryPodStore::new(64));
        let nodes = Arc::new(MemoryNodeStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let scheduler = Scheduler::new(
            SchedulerConfig::default(),
            store.clone(),
            transport,
            nodes.clone(),
            recorder.clone(),
        );

        let (offers, offers_rx) = mpsc::channel(16);
        let (heartbeats, heartbeats_rx) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handles = scheduler.start(offers_rx, heartbeats_rx, shutdown_rx);

        Self {
            scheduler,
            store,
            nodes,
            recorder,
            offers,
            heartbeats,
            shutdown,
            handles,
        }
    }

    async fn offer(&self, offer: ResourceOffer) {
        let before = self.scheduler.offers().len();
        self.offers.send(OfferEvent::Offered(offer)).await.unwrap();
        eventually!({ self.scheduler.offers().len() > before });
    }

    fn events(&self, pod: &Pod, reason: EventReason) -> Vec<String> {
        self.recorder
            .for_object(&ObjectRef::pod(&pod.key()))
            .into_iter()
            .filter(|e| e.reason == reason)
            .map(|e| e.message)
            .collect()
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for handle in self.handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("component did not stop")
                .unwrap();
        }
    }
}

fn foo_bar() -> Pod {
    Pod::new("foo", "bar").with_container(Container::new("app"))
}

fn big_offer(hostname: &str) -> ResourceOffer {
    ResourceOffer::new(hostname)
        .with_cpus(2.0)
        .with_mem(512.0)
        .with_ports(30000, 30010)
}

#[tokio::test]
async fn test_pod_is_scheduled_onto_offer() {
    let transport = Arc::new(MockTransport::new());
    let h = Harness::start(transport.clone());
    h.offer(big_offer("node-1").with_attribute(Attribute::text("rack", "r1")))
        .await;

    let pod = h.store.apply(foo_bar()).await;
    eventually!({ !h.events(&pod, EventReason::Scheduled).is_empty() });

    assert_eq!(
        h.events(&pod, EventReason::Scheduled),
        vec!["Successfully assigned bar to node-1".to_string()]
    );
    let bindings = transport.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].hostname, "node-1");

    let task = h.scheduler.registry().for_pod(&pod.key()).await.unwrap();
    assert_eq!(task.state, TaskState::Launched);
    assert_eq!(task.name, "bar.foo.pods");

    // The agent behind the offer was registered as a node.
    eventually!({ h.nodes.list().await.len() == 1 });
    let nodes = h.nodes.list().await;
    assert_eq!(nodes[0].labels.get(HOSTNAME_LABEL).map(String::as_str), Some("node-1"));
    assert_eq!(
        nodes[0].labels.get("quarry.dev/attribute-rack").map(String::as_str),
        Some("r1")
    );

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_unmatched_pod_backs_off_before_retry() {
    let h = Harness::start(Arc::new(MockTransport::new()));
    h.offer(
        ResourceOffer::new("node-1")
            .with_cpus(0.1)
            .with_mem(512.0)
            .with_ports(30000, 30010),
    )
    .await;

    let pod = h.store.apply(foo_bar()).await;
    eventually!({ h.events(&pod, EventReason::FailedScheduling).len() == 1 });
    let first_seen = tokio::time::Instant::now();

    let task = h.scheduler.registry().for_pod(&pod.key()).await.unwrap();
    assert_eq!(task.attempts, 1);
    assert!(task.is_pending());
    assert_eq!(h.scheduler.errors().attempts(&pod.key()), 1);
    assert!(h.events(&pod, EventReason::FailedScheduling)[0].starts_with("Error scheduling: "));

    let queued = h.scheduler.queue().snapshot();
    assert_eq!(queued.len(), 1);
    assert!(queued[0].ready_in_ms > 0);

    eventually!({ h.events(&pod, EventReason::FailedScheduling).len() == 2 });
    assert!(first_seen.elapsed() >= Duration::from_millis(900));
    assert_eq!(h.scheduler.errors().attempts(&pod.key()), 2);

    h.stop().await;
}

/// Panics on its first bind, then behaves like the mock transport.
struct PanicOnceTransport {
    panicked: AtomicBool,
    inner: MockTransport,
}

#[async_trait]
impl Transport for PanicOnceTransport {
    async fn bind(&self, binding: &Binding) -> Result<(), TransportError> {
        if !self.panicked.swap(true, Ordering::SeqCst) {
            panic!("transport exploded");
        }
        self.inner.bind(binding).await
    }

    async fn kill(&self, task: &TaskId) -> Result<(), TransportError> {
        self.inner.kill(task).await
    }
}

#[tokio::test]
async fn test_loop_survives_panicking_iteration() {
    let transport = Arc::new(PanicOnceTransport {
        panicked: AtomicBool::new(false),
        inner: MockTransport::new(),
    });
    let h = Harness::start(transport.clone());
    h.offer(big_offer("node-1")).await;
    h.offer(big_offer("node-2")).await;

    let first = h.store.apply(Pod::new("foo", "first")).await;
    eventually!({ transport.panicked.load(Ordering::SeqCst) });
    // A newer version arriving around the crash must not be lost.
    let first = h.store.apply(first).await;

    let second = h.store.apply(Pod::new("foo", "second")).await;
    eventually!({ !h.events(&second, EventReason::Scheduled).is_empty() });

    // The crashed pod comes back after its backoff and takes the offer its
    // failed attempt had claimed.
    eventually!({ !h.events(&first, EventReason::Scheduled).is_empty() });
    assert_eq!(transport.inner.bindings().len(), 2);
    assert_eq!(h.scheduler.queue().in_flight(), 0);
    assert!(h.scheduler.offers().is_empty());

    h.stop().await;
}

#[tokio::test]
async fn test_prescheduled_terminating_pod_is_deleted() {
    let h = Harness::start(Arc::new(MockTransport::new()));

    let mut pod = foo_bar();
    pod.spec.node_name = Some("node-9".to_string());
    pod.deletion_timestamp = Some(Utc::now());
    pod.phase = PodPhase::Pending;
    let pod = h.store.apply(pod).await;

    eventually!({ h.store.get(&pod.key()).await.unwrap().is_none() });
    eventually!({ !h.events(&pod, EventReason::Deleted).is_empty() });
    assert!(h.scheduler.registry().for_pod(&pod.key()).await.is_none());

    h.stop().await;
}

#[tokio::test]
async fn test_running_terminating_pod_is_left_to_its_agent() {
    let h = Harness::start(Arc::new(MockTransport::new()));

    let mut pod = foo_bar();
    pod.spec.node_name = Some("node-9".to_string());
    pod.deletion_timestamp = Some(Utc::now());
    pod.phase = PodPhase::Running;
    let pod = h.store.apply(pod).await;

    // Give ingest a chance to see it.
    let marker = h.store.apply(Pod::new("foo", "marker")).await;
    eventually!({ !h.recorder.for_object(&ObjectRef::pod(&marker.key())).is_empty() });

    assert!(h.store.get(&pod.key()).await.unwrap().is_some());
    assert!(h.events(&pod, EventReason::Deleted).is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_replayed_events_do_not_duplicate() {
    let h = Harness::start(Arc::new(MockTransport::new()));

    let pod = h.store.apply(foo_bar()).await;
    eventually!({ h.events(&pod, EventReason::FailedScheduling).len() == 1 });

    for _ in 0..3 {
        h.store.replay(&pod.key()).await;
    }
    // Ingest handles events in order: once the marker fails, the replays
    // have been seen.
    let marker = h.store.apply(Pod::new("foo", "marker")).await;
    eventually!({ !h.events(&marker, EventReason::FailedScheduling).is_empty() });

    assert_eq!(h.scheduler.queue().len(), 2);
    assert_eq!(h.events(&pod, EventReason::FailedScheduling).len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_deleted_pod_kills_launched_task() {
    let transport = Arc::new(MockTransport::new());
    let h = Harness::start(transport.clone());
    h.offer(big_offer("node-1")).await;

    let pod = h.store.apply(foo_bar()).await;
    eventually!({ !h.events(&pod, EventReason::Scheduled).is_empty() });
    let task = h.scheduler.registry().for_pod(&pod.key()).await.unwrap();

    h.store.delete(&pod.key(), 0).await.unwrap();
    eventually!({ transport.killed() == vec![task.id] });
    eventually!({ h.scheduler.registry().get(&task.id).await.is_none() });
    assert!(h.scheduler.registry().is_empty().await);

    h.stop().await;
}

#[tokio::test]
async fn test_heartbeats_confirm_then_lose_task() {
    let transport = Arc::new(MockTransport::new());
    let h = Harness::start(transport.clone());
    h.offer(big_offer("node-1")).await;

    let pod = h.store.apply(foo_bar()).await;
    eventually!({ !h.events(&pod, EventReason::Scheduled).is_empty() });
    let task = h.scheduler.registry().for_pod(&pod.key()).await.unwrap();
    let executor = transport.executor_for(&task.id).unwrap();

    let now = Utc::now();
    let mut node = Node::new("node-1");
    set_running_executor_condition(&mut node, &executor, now);
    h.heartbeats.send(node.clone()).await.unwrap();
    eventually!({
        h.scheduler.registry().get(&task.id).await.map(|t| t.state) == Some(TaskState::Running)
    });

    set_running_executor_condition(
        &mut node,
        &ExecutorId::new("someone-else"),
        now + chrono::Duration::seconds(10),
    );
    h.heartbeats.send(node).await.unwrap();
    eventually!({
        h.scheduler.registry().get(&task.id).await.map(|t| t.state) == Some(TaskState::Lost)
    });
    assert_eq!(h.events(&pod, EventReason::TaskLost).len(), 1);

    h.stop().await;
}

#[tokio::test]
async fn test_debug_routes_after_start() {
    let h = Harness::start(Arc::new(MockTransport::new()));
    let pod = h.store.apply(foo_bar()).await;
    eventually!({ !h.events(&pod, EventReason::FailedScheduling).is_empty() });

    let response = h
        .scheduler
        .router()
        .oneshot(
            Request::builder()
                .uri("/debug/scheduler/podqueue")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["depth"], 1);
    assert_eq!(json["backoff"][0]["pod"], "foo/bar");

    h.stop().await;
}
