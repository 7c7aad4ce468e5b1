//! Data types shared with the state store and the agent transport.

pub mod node;
pub mod offer;
pub mod pod;

pub use node::{ConditionStatus, Node, NodeCondition};
pub use offer::{Attribute, AttributeValue, PortRange, Resource, ResourceOffer};
pub use pod::{Container, ContainerPort, Pod, PodPhase, PodSpec, ResourceList, ResourceRequirements};
