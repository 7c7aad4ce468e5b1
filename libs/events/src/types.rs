//! Event reasons and severities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Reason string constants, as they appear on the wire.
pub mod reasons {
    pub const SCHEDULED: &str = "Scheduled";
    pub const FAILED_SCHEDULING: &str = "FailedScheduling";
    pub const DELETED: &str = "Deleted";
    pub const TASK_LOST: &str = "TaskLost";
}

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EventSeverity {
    #[default]
    Normal,
    Warning,
}

impl fmt::Display for EventSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSeverity::Normal => write!(f, "Normal"),
            EventSeverity::Warning => write!(f, "Warning"),
        }
    }
}

/// Why an event was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventReason {
    /// The pod was bound to a node.
    Scheduled,
    /// No offer matched, or the binding was rejected.
    FailedScheduling,
    /// A pre-assigned pod marked for deletion was removed by the scheduler.
    Deleted,
    /// A heartbeat contradicted the task the scheduler believed was running.
    TaskLost,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::Scheduled => reasons::SCHEDULED,
            EventReason::FailedScheduling => reasons::FAILED_SCHEDULING,
            EventReason::Deleted => reasons::DELETED,
            EventReason::TaskLost => reasons::TASK_LOST,
        }
    }

    /// Severity the reason is reported with.
    pub fn severity(&self) -> EventSeverity {
        match self {
            EventReason::Scheduled | EventReason::Deleted => EventSeverity::Normal,
            EventReason::FailedScheduling | EventReason::TaskLost => EventSeverity::Warning,
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventReason {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            reasons::SCHEDULED => Ok(EventReason::Scheduled),
            reasons::FAILED_SCHEDULING => Ok(EventReason::FailedScheduling),
            reasons::DELETED => Ok(EventReason::Deleted),
            reasons::TASK_LOST => Ok(EventReason::TaskLost),
            other => Err(EventError::UnknownReason(other.to_string())),
        }
    }
}
