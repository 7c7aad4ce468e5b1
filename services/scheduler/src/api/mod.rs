//! Health and debug HTTP endpoints.

mod debug;
mod health;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::offers::OfferRegistry;
use crate::operations::ErrorHandler;
use crate::podtask::TaskRegistry;
use crate::queue::SchedulingQueue;
use crate::runtime::StartLatch;

/// Shared handles the handlers read from.
#[derive(Clone)]
pub struct ApiState {
    pub queue: Arc<SchedulingQueue>,
    pub errors: Arc<ErrorHandler>,
    pub registry: Arc<TaskRegistry>,
    pub offers: Arc<OfferRegistry>,
    /// Debug routes answer 503 until the scheduler has started.
    pub latch: StartLatch,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .merge(health::routes())
        .nest("/debug", debug::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
