//! Worker node bookkeeping: attribute labels, the running-executor
//! condition and node registration.

pub mod condition;
pub mod labels;
pub mod registration;

pub use condition::{parse_condition_reason, set_running_executor_condition, RUNNING_EXECUTOR};
pub use labels::{attributes_to_labels, is_attribute_label, is_up_to_date, HOSTNAME_LABEL, LABEL_PREFIX};
pub use registration::{MemoryNodeStore, NodeRegistrar, NodeStore, NodeStoreError, RegistrationError};
