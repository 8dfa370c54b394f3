//! User-visible sync events.

use std::sync::Mutex;

use tracing::{info, warn};

use flotilla_core::WorkRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub work: WorkRef,
    pub reason: String,
    pub message: String,
}

pub trait EventSink: Send + Sync {
    fn event(&self, kind: EventKind, work: &WorkRef, reason: &str, message: String);
}

/// Default sink: events land in the log stream.
#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn event(&self, kind: EventKind, work: &WorkRef, reason: &str, message: String) {
        match kind {
            EventKind::Normal => info!(work = %work, reason = %reason, "{}", message),
            EventKind::Warning => warn!(work = %work, reason = %reason, "{}", message),
        }
    }
}

/// Recording sink for tests.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }
}

impl EventSink for MemoryEventSink {
    fn event(&self, kind: EventKind, work: &WorkRef, reason: &str, message: String) {
        self.events.lock().unwrap().push(Event {
            kind,
            work: work.clone(),
            reason: reason.to_string(),
            message,
        });
    }
}
