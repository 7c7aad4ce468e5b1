//! # quarry-id
//!
//! Identifier types shared by the quarry scheduler crates.
//!
//! - [`TaskId`] and [`OfferId`] are ULID-backed and render as
//!   `{prefix}_{ulid}` (`task_01HV4Z…`, `offer_01HV4Z…`).
//! - [`PodKey`] is the `namespace/name` identity of a pod in the state store.
//! - [`ExecutorId`] is the opaque correlation id an agent reports for its
//!   running executor.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-exported for the `define_id!` macro.
pub use ulid::Ulid;
