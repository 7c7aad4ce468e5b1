//! Event sinks.

use std::sync::Mutex;

use tracing::{info, warn};

use crate::{EventReason, EventSeverity, ObjectRef, SchedulingEvent};

/// Sink for scheduling events.
///
/// Recording is fire-and-forget: a recorder must not block the caller and
/// must not fail it.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: SchedulingEvent);

    /// Build and record an event in one call.
    fn event(&self, involved: ObjectRef, reason: EventReason, message: String) {
        self.record(SchedulingEvent::new(involved, reason, message));
    }
}

/// Writes events to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, event: SchedulingEvent) {
        match event.severity {
            EventSeverity::Normal => info!(
                object = %event.involved,
                reason = %event.reason,
                message = %event.message,
                "event"
            ),
            EventSeverity::Warning => warn!(
                object = %event.involved,
                reason = %event.reason,
                message = %event.message,
                "event"
            ),
        }
    }
}

/// Keeps every recorded event in memory.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<SchedulingEvent>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, oldest first.
    pub fn events(&self) -> Vec<SchedulingEvent> {
        self.lock().clone()
    }

    /// Events with the given reason.
    pub fn with_reason(&self, reason: EventReason) -> Vec<SchedulingEvent> {
        self.lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }

    /// Events attached to the given object.
    pub fn for_object(&self, involved: &ObjectRef) -> Vec<SchedulingEvent> {
        self.lock()
            .iter()
            .filter(|e| &e.involved == involved)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<SchedulingEvent>> {
        // A panic while holding the lock leaves the Vec intact.
        self.events.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, event: SchedulingEvent) {
        self.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_id::PodKey;

    #[test]
    fn test_memory_recorder_filters() {
        let recorder = MemoryRecorder::new();
        let bar = ObjectRef::pod(&PodKey::new("foo", "bar"));
        let baz = ObjectRef::pod(&PodKey::new("foo", "baz"));

        recorder.event(
            bar.clone(),
            EventReason::FailedScheduling,
            "Error scheduling: no suitable offers".into(),
        );
        recorder.event(
            bar.clone(),
            EventReason::Scheduled,
            "Successfully assigned bar to n1".into(),
        );
        recorder.event(baz.clone(), EventReason::Scheduled, "Successfully assigned baz to n2".into());

        assert_eq!(recorder.len(), 3);
        assert_eq!(recorder.for_object(&bar).len(), 2);
        assert_eq!(recorder.with_reason(EventReason::Scheduled).len(), 2);
        assert_eq!(recorder.events()[0].reason, EventReason::FailedScheduling);
    }

    #[test]
    fn test_log_recorder_is_object_safe() {
        let recorder: Box<dyn EventRecorder> = Box::new(LogRecorder);
        recorder.event(ObjectRef::node("n1"), EventReason::TaskLost, "lost".into());
    }
}
