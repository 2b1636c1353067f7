use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, warn};

use crate::domain::{Event, EventContext, EventSeverity, EventType};

use super::filter::EventFilter;

/// Default ring capacity (§4.A).
pub const DEFAULT_CAPACITY: usize = 1000;

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Inner {
    ring: VecDeque<Event>,
    capacity: usize,
    listeners: Vec<(u64, Listener)>,
}

/// Process-wide singleton holding a bounded ring of events.
///
/// All mutating operations take a short critical section; emission is not
/// lock-free, but the section does no I/O, so contention is bounded by the
/// size of the listener fan-out.
pub struct EventBus {
    inner: Mutex<Inner>,
    next_listener_id: AtomicU64,
    listener_panics: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                listeners: Vec::new(),
            }),
            next_listener_id: AtomicU64::new(0),
            listener_panics: AtomicU64::new(0),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Allocate an id, stamp the event, append to the ring (evicting the
    /// oldest entry past capacity), and synchronously fan out to listeners.
    pub fn emit(&self, event_type: EventType, severity: EventSeverity, data: Value, ctx: EventContext) -> Event {
        let wallclock_ms = chrono::Utc::now().timestamp_millis();
        let event = Event::new(wallclock_ms, event_type, severity, data, ctx);

        let listeners = {
            let mut inner = self.inner.lock().expect("event bus mutex poisoned");
            inner.ring.push_back(event.clone());
            while inner.ring.len() > inner.capacity {
                inner.ring.pop_front();
            }
            inner.listeners.iter().map(|(_, l)| l.clone()).collect::<Vec<_>>()
        };

        for listener in listeners {
            let event_ref = &event;
            if catch_unwind(AssertUnwindSafe(|| listener(event_ref))).is_err() {
                self.listener_panics.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %event.id, "event bus listener panicked; swallowed");
            }
        }

        debug!(event_id = %event.id, event_type = %event.event_type, "EventBus::emit");
        event
    }

    /// Register a listener; returns a token usable with `remove_listener`.
    pub fn add_listener(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> u64 {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .lock()
            .expect("event bus mutex poisoned")
            .listeners
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, token: u64) {
        self.inner
            .lock()
            .expect("event bus mutex poisoned")
            .listeners
            .retain(|(id, _)| *id != token);
    }

    /// Count of listener panics swallowed so far; the Metrics Bridge folds
    /// this into its error counters on its periodic tick.
    pub fn listener_panic_count(&self) -> u64 {
        self.listener_panics.load(Ordering::Relaxed)
    }

    /// Events strictly after `filter.since`, further narrowed by type,
    /// severity, task/prd id, then capped by `filter.limit`.
    pub fn poll(&self, filter: &EventFilter) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        let mut results: Vec<Event> = inner
            .ring
            .iter()
            .filter(|e| filter.since.is_none_or(|since| e.sequence() > since))
            .filter(|e| filter.types.as_ref().is_none_or(|ts| ts.contains(&e.event_type)))
            .filter(|e| filter.severities.as_ref().is_none_or(|ss| ss.contains(&e.severity)))
            .filter(|e| filter.task_id.as_ref().is_none_or(|id| e.task_id.as_deref() == Some(id.as_str())))
            .filter(|e| filter.prd_id.as_ref().is_none_or(|id| e.prd_id.as_deref() == Some(id.as_str())))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            results.truncate(limit);
        }
        results
    }

    pub fn get_latest(&self, n: usize) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.ring.iter().rev().take(n).rev().cloned().collect()
    }

    pub fn get_by_type(&self, event_type: EventType) -> Vec<Event> {
        let inner = self.inner.lock().expect("event bus mutex poisoned");
        inner.ring.iter().filter(|e| e.event_type == event_type).cloned().collect()
    }

    pub fn clear(&self) {
        self.inner.lock().expect("event bus mutex poisoned").ring.clear();
    }

    pub fn count(&self) -> usize {
        self.inner.lock().expect("event bus mutex poisoned").ring.len()
    }

    pub fn get_last_event_id(&self) -> Option<String> {
        self.inner.lock().expect("event bus mutex poisoned").ring.back().map(|e| e.id.clone())
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

pub fn create_event_bus() -> Arc<EventBus> {
    Arc::new(EventBus::with_default_capacity())
}
