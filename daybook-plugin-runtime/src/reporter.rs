//! Central error sink for the plugin runtime.
//!
//! Every failure that crosses the trust boundary lands here: the reporter
//! normalizes it into an `ErrorRecord`, appends it to a capped global log,
//! notifies registered observers, and echoes it on the audit bus. One
//! misbehaving observer must never prevent error reporting.

use chrono::{DateTime, Utc};
use daybook_types::{topics, EventBus, RecordId, RingLog};
use serde::Serialize;
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A normalized error entry in the global log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub id: RecordId,
    pub plugin_id: Option<String>,
    pub operation: String,
    pub message: String,
    /// The `source()` chain of the original error, outermost first.
    pub source_chain: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

type Observer = Box<dyn Fn(&ErrorRecord) + Send + Sync>;

/// Central error sink; shared by every runtime component.
pub struct ErrorReporter {
    bus: Arc<dyn EventBus>,
    log: Mutex<RingLog<ErrorRecord>>,
    observers: Mutex<Vec<(String, Observer)>>,
}

impl ErrorReporter {
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, max_log_size: usize) -> Self {
        Self {
            bus,
            log: Mutex::new(RingLog::new(max_log_size)),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Registers an observer under an id, replacing any previous one with
    /// the same id.
    pub fn add_observer(
        &self,
        id: impl Into<String>,
        observer: impl Fn(&ErrorRecord) + Send + Sync + 'static,
    ) {
        let id = id.into();
        let mut observers = self.observers.lock().expect("observer lock poisoned");
        observers.retain(|(existing, _)| *existing != id);
        observers.push((id, Box::new(observer)));
    }

    /// Removes an observer. Returns whether it was registered.
    pub fn remove_observer(&self, id: &str) -> bool {
        let mut observers = self.observers.lock().expect("observer lock poisoned");
        let before = observers.len();
        observers.retain(|(existing, _)| existing != id);
        observers.len() != before
    }

    /// Reports a failure carried by a full error value, preserving its
    /// source chain.
    pub fn report_error(
        &self,
        plugin_id: Option<&str>,
        operation: &str,
        error: &(dyn std::error::Error + 'static),
        metadata: Value,
    ) -> ErrorRecord {
        let mut chain = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        self.record(plugin_id, operation, error.to_string(), chain, metadata)
    }

    /// Reports a failure that only carries a message (arbitrary non-error
    /// values thrown across the boundary).
    pub fn report_message(
        &self,
        plugin_id: Option<&str>,
        operation: &str,
        message: impl Into<String>,
        metadata: Value,
    ) -> ErrorRecord {
        self.record(plugin_id, operation, message.into(), Vec::new(), metadata)
    }

    fn record(
        &self,
        plugin_id: Option<&str>,
        operation: &str,
        message: String,
        source_chain: Vec<String>,
        metadata: Value,
    ) -> ErrorRecord {
        let record = ErrorRecord {
            id: RecordId::new(),
            plugin_id: plugin_id.map(str::to_string),
            operation: operation.to_string(),
            message,
            source_chain,
            timestamp: Utc::now(),
            metadata,
        };

        warn!(
            plugin_id = record.plugin_id.as_deref().unwrap_or("app"),
            operation = %record.operation,
            "Plugin error: {}",
            record.message
        );

        self.log
            .lock()
            .expect("error log lock poisoned")
            .push(record.clone());

        self.notify_observers(&record);

        self.bus.publish(
            topics::PLUGIN_ERROR,
            json!({
                "id": record.id.to_string(),
                "plugin_id": record.plugin_id,
                "operation": record.operation,
                "message": record.message,
            }),
        );

        record
    }

    fn notify_observers(&self, record: &ErrorRecord) {
        let observers = self.observers.lock().expect("observer lock poisoned");
        for (id, observer) in observers.iter() {
            // A panicking observer is isolated; reporting must proceed.
            if catch_unwind(AssertUnwindSafe(|| observer(record))).is_err() {
                warn!(observer_id = %id, "Error observer panicked, skipping");
            }
        }
    }

    /// The global log, newest-first, optionally limited.
    #[must_use]
    pub fn error_log(&self, limit: Option<usize>) -> Vec<ErrorRecord> {
        self.log
            .lock()
            .expect("error log lock poisoned")
            .snapshot(limit)
    }

    /// Errors attributed to one plugin, newest-first.
    #[must_use]
    pub fn errors_for_plugin(&self, plugin_id: &str) -> Vec<ErrorRecord> {
        self.log
            .lock()
            .expect("error log lock poisoned")
            .iter()
            .filter(|r| r.plugin_id.as_deref() == Some(plugin_id))
            .cloned()
            .collect()
    }

    /// Drops the global log.
    pub fn clear(&self) {
        self.log.lock().expect("error log lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reporter_with_bus() -> (Arc<MemoryBus>, ErrorReporter) {
        let bus = Arc::new(MemoryBus::new());
        let reporter = ErrorReporter::new(Arc::clone(&bus) as Arc<dyn EventBus>, 5);
        (bus, reporter)
    }

    #[test]
    fn report_message_appends_and_publishes() {
        let (bus, reporter) = reporter_with_bus();
        let record =
            reporter.report_message(Some("p1"), "activate", "boom", json!({"attempt": 1}));

        assert_eq!(record.plugin_id.as_deref(), Some("p1"));
        assert_eq!(reporter.error_log(None).len(), 1);
        assert_eq!(bus.events_for(topics::PLUGIN_ERROR).len(), 1);
    }

    #[test]
    fn report_error_captures_source_chain() {
        let (_, reporter) = reporter_with_bus();
        let io = std::io::Error::other("disk gone");
        let wrapped = anyhow::Error::from(io).context("loading manifest");

        let record = reporter.report_error(
            Some("p1"),
            "load",
            wrapped.as_ref(),
            Value::Null,
        );
        assert_eq!(record.message, "loading manifest");
        assert_eq!(record.source_chain, vec!["disk gone".to_string()]);
    }

    #[test]
    fn log_is_capped_newest_first() {
        let (_, reporter) = reporter_with_bus();
        for n in 0..8 {
            reporter.report_message(Some("p1"), "op", format!("err {n}"), Value::Null);
        }
        let log = reporter.error_log(None);
        assert_eq!(log.len(), 5);
        assert_eq!(log[0].message, "err 7");
        assert_eq!(log[4].message, "err 3");
    }

    #[test]
    fn errors_for_plugin_filters() {
        let (_, reporter) = reporter_with_bus();
        reporter.report_message(Some("a"), "op", "one", Value::Null);
        reporter.report_message(Some("b"), "op", "two", Value::Null);
        reporter.report_message(Some("a"), "op", "three", Value::Null);

        let a_errors = reporter.errors_for_plugin("a");
        assert_eq!(a_errors.len(), 2);
        assert_eq!(a_errors[0].message, "three");
    }

    // ================================================================
    // Observer isolation
    // ================================================================

    #[test]
    fn panicking_observer_does_not_block_reporting() {
        let (_, reporter) = reporter_with_bus();
        let seen = Arc::new(AtomicUsize::new(0));

        reporter.add_observer("bad", |_| panic!("observer bug"));
        let seen_clone = Arc::clone(&seen);
        reporter.add_observer("good", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        let record = reporter.report_message(Some("p1"), "op", "err", Value::Null);
        assert_eq!(record.message, "err");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(reporter.error_log(None).len(), 1);
    }

    #[test]
    fn remove_observer_stops_notifications() {
        let (_, reporter) = reporter_with_bus();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        reporter.add_observer("obs", move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        reporter.report_message(None, "op", "first", Value::Null);
        assert!(reporter.remove_observer("obs"));
        reporter.report_message(None, "op", "second", Value::Null);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_resets_log() {
        let (_, reporter) = reporter_with_bus();
        reporter.report_message(None, "op", "err", Value::Null);
        reporter.clear();
        assert!(reporter.error_log(None).is_empty());
    }
}
