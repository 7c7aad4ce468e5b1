//! Scheduler-side view of a pod: its task, the offer predicates and the
//! registry of live tasks.

pub mod predicate;
pub mod registry;
pub mod task;

pub use predicate::{
    NodeSelectorPredicate, OfferPresentPredicate, PodFitsPortsPredicate, PodFitsResourcesPredicate,
    Predicate, PredicateChain,
};
pub use registry::{RegistryError, TaskRegistry};
pub use task::{generate_task_name, Task, TaskState};
