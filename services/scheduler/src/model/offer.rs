//! Resource offers advertised by agents.

use quarry_id::OfferId;
use serde::{Deserialize, Serialize};

/// Scalar resource name for CPU, in cores.
pub const CPUS: &str = "cpus";
/// Scalar resource name for memory, in MiB.
pub const MEM: &str = "mem";
/// Range resource name for host ports.
pub const PORTS: &str = "ports";

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(begin: u16, end: u16) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.begin <= port && port <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Resource {
    Scalar { name: String, value: f64 },
    Ranges { name: String, ranges: Vec<PortRange> },
}

impl Resource {
    pub fn name(&self) -> &str {
        match self {
            Resource::Scalar { name, .. } | Resource::Ranges { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Scalar(f64),
    Text(String),
}

/// Agent attribute, e.g. `rack=a1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: AttributeValue::Text(value.into()),
        }
    }

    pub fn scalar(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: AttributeValue::Scalar(value),
        }
    }
}

/// A time-limited advertisement of resources on one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub id: OfferId,
    pub agent_id: String,
    pub hostname: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
}

impl ResourceOffer {
    /// An empty offer from the agent on `hostname`.
    pub fn new(hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        Self {
            id: OfferId::new(),
            agent_id: format!("agent-{hostname}"),
            hostname,
            resources: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn with_cpus(self, value: f64) -> Self {
        self.with_scalar(CPUS, value)
    }

    pub fn with_mem(self, value: f64) -> Self {
        self.with_scalar(MEM, value)
    }

    pub fn with_scalar(mut self, name: &str, value: f64) -> Self {
        self.resources.push(Resource::Scalar {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn with_ports(mut self, begin: u16, end: u16) -> Self {
        self.resources.push(Resource::Ranges {
            name: PORTS.to_string(),
            ranges: vec![PortRange::new(begin, end)],
        });
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Sum of every scalar resource called `name`; zero if absent.
    pub fn scalar(&self, name: &str) -> f64 {
        self.resources
            .iter()
            .filter_map(|r| match r {
                Resource::Scalar { name: n, value } if n == name => Some(*value),
                _ => None,
            })
            .sum()
    }

    pub fn cpus(&self) -> f64 {
        self.scalar(CPUS)
    }

    pub fn mem(&self) -> f64 {
        self.scalar(MEM)
    }

    pub fn port_ranges(&self) -> impl Iterator<Item = &PortRange> {
        self.resources.iter().flat_map(|r| match r {
            Resource::Ranges { name, ranges } if name == PORTS => ranges.as_slice(),
            _ => &[][..],
        })
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.port_ranges().any(|r| r.contains(port))
    }
}
