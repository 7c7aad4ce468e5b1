//! Pod records as delivered by the state store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use quarry_id::PodKey;
use serde::{Deserialize, Serialize};

use crate::resources::{CpuCores, MegaBytes};

/// Lifecycle phase reported for a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PodPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

/// CPU and memory quantities; `None` means "not declared".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuCores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MegaBytes>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub limits: ResourceList,
    #[serde(default)]
    pub requests: ResourceList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub container_port: u16,
    /// Zero asks for no particular host port.
    #[serde(default)]
    pub host_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
}

impl Container {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resources: ResourceRequirements::default(),
            ports: Vec::new(),
        }
    }

    pub fn with_cpu_limit(mut self, cpu: f64) -> Self {
        self.resources.limits.cpu = Some(CpuCores(cpu));
        self
    }

    pub fn with_mem_limit(mut self, mem: f64) -> Self {
        self.resources.limits.memory = Some(MegaBytes(mem));
        self
    }

    pub fn with_host_port(mut self, container_port: u16, host_port: u16) -> Self {
        self.ports.push(ContainerPort {
            name: None,
            container_port,
            host_port,
            protocol: default_protocol(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PodSpec {
    #[serde(default)]
    pub containers: Vec<Container>,

    /// Node the pod is bound to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Labels a node must carry for the pod to land on it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// A unit of work awaiting placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    pub namespace: String,
    pub name: String,

    /// Store revision; bumped on every write.
    #[serde(default)]
    pub resource_version: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub spec: PodSpec,

    #[serde(default)]
    pub phase: PodPhase,

    pub creation_timestamp: DateTime<Utc>,

    /// Set once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Pod {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            resource_version: 0,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            spec: PodSpec::default(),
            phase: PodPhase::Pending,
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    pub fn with_container(mut self, container: Container) -> Self {
        self.spec.containers.push(container);
        self
    }

    pub fn with_node_selector(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.node_selector.insert(key.into(), value.into());
        self
    }

    /// Store identity; an empty namespace maps to the default one.
    pub fn key(&self) -> PodKey {
        PodKey::new(self.namespace.as_str(), self.name.as_str())
    }

    pub fn is_assigned(&self) -> bool {
        self.spec.node_name.is_some()
    }

    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Host ports the pod asks for, skipping the "any port" zero.
    pub fn host_ports(&self) -> Vec<u16> {
        self.spec
            .containers
            .iter()
            .flat_map(|c| c.ports.iter())
            .map(|p| p.host_port)
            .filter(|&p| p != 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_normalises_namespace() {
        let pod = Pod::new("", "web");
        assert_eq!(pod.key().to_string(), "default/web");
    }

    #[test]
    fn test_host_ports_skip_zero() {
        let pod = Pod::new("foo", "bar")
            .with_container(Container::new("a").with_host_port(80, 0))
            .with_container(Container::new("b").with_host_port(8080, 31000));
        assert_eq!(pod.host_ports(), vec![31000]);
    }

    #[test]
    fn test_pod_from_json_defaults() {
        let pod: Pod = serde_json::from_str(
            r#"{
                "namespace": "foo",
                "name": "bar",
                "creation_timestamp": "2024-01-01T00:00:00Z",
                "spec": {"containers": [{"name": "c", "ports": [{"container_port": 80}]}]}
            }"#,
        )
        .unwrap();
        assert_eq!(pod.phase, PodPhase::Pending);
        assert_eq!(pod.spec.containers[0].ports[0].protocol, "TCP");
        assert_eq!(pod.spec.containers[0].ports[0].host_port, 0);
        assert!(!pod.is_assigned());
    }
}
