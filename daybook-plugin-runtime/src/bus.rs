//! In-process event bus implementations.
//!
//! The runtime only depends on the `EventBus` trait; these are the two
//! implementations the host wires in. `InProcessBus` fans events out to
//! registered observers; `MemoryBus` retains them (for testing and
//! diagnostics).

use daybook_types::EventBus;
use serde_json::Value;
use std::sync::Mutex;
use tracing::debug;

type BusObserver = Box<dyn Fn(&str, &Value) + Send + Sync>;

/// Fans published events out to registered observers, fire-and-forget.
#[derive(Default)]
pub struct InProcessBus {
    observers: Mutex<Vec<(String, BusObserver)>>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer under an id, replacing any previous one with
    /// the same id.
    pub fn subscribe(
        &self,
        id: impl Into<String>,
        observer: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) {
        let id = id.into();
        let mut observers = self.observers.lock().expect("bus lock poisoned");
        observers.retain(|(existing, _)| *existing != id);
        observers.push((id, Box::new(observer)));
    }

    /// Removes an observer. Returns whether it was registered.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut observers = self.observers.lock().expect("bus lock poisoned");
        let before = observers.len();
        observers.retain(|(existing, _)| existing != id);
        observers.len() != before
    }
}

impl EventBus for InProcessBus {
    fn publish(&self, topic: &str, payload: Value) {
        debug!(topic = %topic, "Event published");
        let observers = self.observers.lock().expect("bus lock poisoned");
        for (_, observer) in observers.iter() {
            observer(topic, &payload);
        }
    }
}

/// Retains every published event (for testing and diagnostics).
#[derive(Default)]
pub struct MemoryBus {
    events: Mutex<Vec<(String, Value)>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events published so far, oldest-first.
    #[must_use]
    pub fn events(&self) -> Vec<(String, Value)> {
        self.events.lock().expect("bus lock poisoned").clone()
    }

    /// Events published on one topic, oldest-first.
    #[must_use]
    pub fn events_for(&self, topic: &str) -> Vec<Value> {
        self.events
            .lock()
            .expect("bus lock poisoned")
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().expect("bus lock poisoned").clear();
    }
}

impl EventBus for MemoryBus {
    fn publish(&self, topic: &str, payload: Value) {
        debug!(topic = %topic, "Event recorded");
        self.events
            .lock()
            .expect("bus lock poisoned")
            .push((topic.to_string(), payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn in_process_bus_fans_out() {
        let bus = InProcessBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        bus.subscribe("a", move |_, _| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        bus.subscribe("b", move |_, _| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish("topic", json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribe_same_id_replaces() {
        let bus = InProcessBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        bus.subscribe("a", move |_, _| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = Arc::clone(&count);
        bus.subscribe("a", move |_, _| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        bus.publish("topic", json!({}));
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn unsubscribe_removes_observer() {
        let bus = InProcessBus::new();
        bus.subscribe("a", |_, _| {});
        assert!(bus.unsubscribe("a"));
        assert!(!bus.unsubscribe("a"));
    }

    #[test]
    fn memory_bus_retains_by_topic() {
        let bus = MemoryBus::new();
        bus.publish("x", json!({"n": 1}));
        bus.publish("y", json!({"n": 2}));
        bus.publish("x", json!({"n": 3}));

        assert_eq!(bus.events().len(), 3);
        let xs = bus.events_for("x");
        assert_eq!(xs.len(), 2);
        assert_eq!(xs[0]["n"], 1);
        assert_eq!(xs[1]["n"], 3);
    }
}
