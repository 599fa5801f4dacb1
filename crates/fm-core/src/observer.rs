//! Push notifications for hosts that want them.
//!
//! Observers are registered explicitly with
//! [`FieldMemory::subscribe`](crate::engine::FieldMemory::subscribe) and
//! called synchronously, in registration order, after the engine state for
//! the event is final.

use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::emergence::TriggerPolicy;
use crate::query::QueryMode;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FieldEvent {
    Stored { count: usize },
    QueryCompleted { mode: QueryMode, results: usize, latency_ms: f64 },
    InsightsEmerged { count: usize, trigger: Option<TriggerPolicy> },
    FeedbackApplied { nodes: usize },
    /// The persistence collaborator failed; the engine runs in memory.
    Degraded { reason: String },
    /// The persistence collaborator answered again after a failure.
    Recovered,
    Cleared,
}

pub trait FieldObserver: Send + Sync {
    fn on_event(&self, event: &FieldEvent);
}

/// Forwards events to `tracing` at debug level, warnings for degradation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl FieldObserver for TracingObserver {
    fn on_event(&self, event: &FieldEvent) {
        match event {
            FieldEvent::Degraded { reason } => tracing::warn!(reason = %reason, "field memory degraded"),
            other => tracing::debug!(event = ?other, "field event"),
        }
    }
}

/// Keeps every event in memory. Clones share the same log.
#[derive(Debug, Default, Clone)]
pub struct EventLog {
    events: Arc<Mutex<Vec<FieldEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FieldEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl FieldObserver for EventLog {
    fn on_event(&self, event: &FieldEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event.clone());
    }
}
