//! # quarry-events
//!
//! Observability events emitted by the scheduler.
//!
//! Events are advisory records tied to one object (normally a pod). They are
//! never read back by the scheduler to make decisions.
//!
//! - [`SchedulingEvent`] is the record itself.
//! - [`EventReason`] enumerates the reasons the scheduler reports.
//! - [`EventRecorder`] is the sink; [`LogRecorder`] writes to `tracing`,
//!   [`MemoryRecorder`] keeps events in memory for tests and introspection.

mod envelope;
mod error;
mod recorder;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use recorder::*;
pub use types::*;
