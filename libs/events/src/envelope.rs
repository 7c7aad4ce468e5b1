//! The event record and the reference to the object it concerns.

use std::fmt;

use chrono::{DateTime, Utc};
use quarry_id::PodKey;
use serde::{Deserialize, Serialize};

use crate::{EventError, EventReason, EventSeverity};

/// Kind of object an event is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Pod,
    Node,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::Pod => write!(f, "Pod"),
            ObjectKind::Node => write!(f, "Node"),
        }
    }
}

/// Reference to the object an event is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectRef {
    pub kind: ObjectKind,

    /// Empty for cluster-scoped objects (nodes).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    pub name: String,
}

impl ObjectRef {
    pub fn pod(key: &PodKey) -> Self {
        Self {
            kind: ObjectKind::Pod,
            namespace: key.namespace().to_string(),
            name: key.name().to_string(),
        }
    }

    pub fn node(name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Node,
            namespace: String::new(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// An observability event emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulingEvent {
    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// The object the event concerns.
    pub involved: ObjectRef,

    pub reason: EventReason,

    pub severity: EventSeverity,

    /// Human-readable message.
    pub message: String,
}

impl SchedulingEvent {
    /// Build an event stamped with the current time; severity follows the
    /// reason.
    pub fn new(involved: ObjectRef, reason: EventReason, message: impl Into<String>) -> Self {
        Self {
            occurred_at: Utc::now(),
            involved,
            reason,
            severity: reason.severity(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_ref_display() {
        let key = PodKey::new("foo", "bar");
        assert_eq!(ObjectRef::pod(&key).to_string(), "Pod/foo/bar");
        assert_eq!(ObjectRef::node("n1").to_string(), "Node/n1");
    }

    #[test]
    fn test_event_json_shape() {
        let event = SchedulingEvent::new(
            ObjectRef::pod(&PodKey::new("foo", "bar")),
            EventReason::FailedScheduling,
            "Error scheduling: no suitable offers",
        );
        assert_eq!(event.severity, EventSeverity::Warning);

        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(json["reason"], "FailedScheduling");
        assert_eq!(json["severity"], "Warning");
        assert_eq!(json["involved"]["namespace"], "foo");
        assert!(json["involved"].get("namespace").is_some());

        let node = SchedulingEvent::new(ObjectRef::node("n1"), EventReason::TaskLost, "lost");
        let json: serde_json::Value = serde_json::from_str(&node.to_json().unwrap()).unwrap();
        assert!(json["involved"].get("namespace").is_none());
    }
}
