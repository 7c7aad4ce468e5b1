//! quarry scheduler library.
//!
//! This crate ships the `quarry-scheduler` binary, but exposes its pieces as
//! a library so they can be wired against other stores and transports and
//! exercised by integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod model;
pub mod node;
pub mod offers;
pub mod operations;
pub mod podtask;
pub mod queue;
pub mod resources;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod transport;

pub use error::{Result, SchedulerError};
pub use scheduler::Scheduler;
