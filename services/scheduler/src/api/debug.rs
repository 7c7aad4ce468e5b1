//! Read-only introspection of scheduler state.
//!
//! Snapshots are taken without stopping the scheduler and may be stale by
//! the time they are rendered.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use quarry_id::{ExecutorId, PodKey, TaskId};
use serde::Serialize;

use crate::api::ApiState;
use crate::podtask::TaskState;
use crate::queue::QueueEntrySnapshot;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/scheduler/podqueue", get(pod_queue))
        .route("/registry/tasks", get(tasks))
        .route("/offers", get(offers))
}

#[derive(Debug, Serialize)]
struct BackoffEntry {
    pod: PodKey,
    attempts: u32,
    delay_ms: u64,
    remaining_ms: u64,
}

#[derive(Debug, Serialize)]
struct PodQueueResponse {
    depth: usize,
    in_flight: usize,
    entries: Vec<QueueEntrySnapshot>,
    backoff: Vec<BackoffEntry>,
}

#[derive(Debug, Serialize)]
struct TaskSummary {
    id: TaskId,
    name: String,
    pod: PodKey,
    state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    executor_id: Option<ExecutorId>,
    attempts: u32,
}

fn not_started() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "scheduler not started").into_response()
}

async fn pod_queue(State(state): State<ApiState>) -> Response {
    if !state.latch.is_open() {
        return not_started();
    }

    let entries = state.queue.snapshot();
    let backoff = state
        .errors
        .snapshot()
        .into_iter()
        .map(|(pod, b)| BackoffEntry {
            pod,
            attempts: b.attempts,
            delay_ms: b.delay.as_millis() as u64,
            remaining_ms: b.remaining.as_millis() as u64,
        })
        .collect();

    Json(PodQueueResponse {
        depth: entries.len(),
        in_flight: state.queue.in_flight(),
        entries,
        backoff,
    })
    .into_response()
}

async fn tasks(State(state): State<ApiState>) -> Response {
    if !state.latch.is_open() {
        return not_started();
    }

    let tasks: Vec<_> = state
        .registry
        .list()
        .await
        .into_iter()
        .map(|t| TaskSummary {
            id: t.id,
            name: t.name,
            pod: t.pod_key,
            state: t.state,
            hostname: t.hostname,
            executor_id: t.executor_id,
            attempts: t.attempts,
        })
        .collect();
    Json(tasks).into_response()
}

async fn offers(State(state): State<ApiState>) -> Response {
    if !state.latch.is_open() {
        return not_started();
    }
    Json(state.offers.summaries()).into_response()
}
