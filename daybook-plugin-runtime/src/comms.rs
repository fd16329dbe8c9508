//! Cross-plugin call orchestration.
//!
//! The hub sits in front of the API registry: it records every call attempt
//! in both parties' histories, validates liveness and plugin-level
//! compatibility, then delegates the actual invocation. It also owns the
//! channel subsystem.
//!
//! A call's record moves `pending → success | error`, strictly sequential
//! per call, and the outcome is always echoed on the audit bus.

use crate::access::ApiRegistry;
use crate::channels::{ChannelHandle, ChannelOptions, ChannelSet, SubscriberCallback, SubscriptionHandle};
use crate::error::{Result, RuntimeError};
use crate::reporter::ErrorReporter;
use chrono::{DateTime, Utc};
use daybook_types::{topics, ActorId, ConflictLookup, EventBus, PluginRegistry, RecordId, RingLog};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Pending,
    Success,
    Error,
}

/// One orchestrated call, mirrored into both parties' histories.
#[derive(Debug, Clone, Serialize)]
pub struct CommunicationRecord {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub caller_id: String,
    pub target_id: String,
    pub method_name: String,
    pub status: CallStatus,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Orchestrates cross-plugin calls and owns the channel subsystem.
pub struct CommsHub {
    registry: Arc<dyn PluginRegistry>,
    conflicts: Arc<dyn ConflictLookup>,
    apis: Arc<ApiRegistry>,
    reporter: Arc<ErrorReporter>,
    bus: Arc<dyn EventBus>,
    max_history_size: usize,
    histories: Mutex<HashMap<String, RingLog<CommunicationRecord>>>,
    channels: Arc<ChannelSet>,
}

impl CommsHub {
    #[must_use]
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        conflicts: Arc<dyn ConflictLookup>,
        apis: Arc<ApiRegistry>,
        reporter: Arc<ErrorReporter>,
        bus: Arc<dyn EventBus>,
        max_history_size: usize,
    ) -> Self {
        let channels = Arc::new(ChannelSet::new(
            Arc::clone(&conflicts),
            Arc::clone(&reporter),
            Arc::clone(&bus),
        ));
        Self {
            registry,
            conflicts,
            apis,
            reporter,
            bus,
            max_history_size,
            histories: Mutex::new(HashMap::new()),
            channels,
        }
    }

    // ================================================================
    // Orchestrated calls
    // ================================================================

    /// Calls `target.method(args)` on behalf of plugin `caller_id`.
    ///
    /// The pending record is written before any validation so failed
    /// attempts are visible in both histories.
    pub fn call_plugin_method(
        &self,
        caller_id: &str,
        target_id: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        let record_id = self.open_record(caller_id, target_id, method);

        if let Err(err) = self.validate_call(caller_id, target_id) {
            self.finalize_record(record_id, caller_id, target_id, CallStatus::Error, Some(err.to_string()), None);
            self.reporter.report_message(
                Some(caller_id),
                "comms:call",
                err.to_string(),
                json!({ "target": target_id, "method": method }),
            );
            self.publish_outcome(record_id, caller_id, target_id, method, CallStatus::Error, Some(&err));
            return Err(err);
        }

        let caller = ActorId::plugin(caller_id);
        match self.apis.call_plugin_method(&caller, target_id, method, args) {
            Ok(value) => {
                self.finalize_record(
                    record_id,
                    caller_id,
                    target_id,
                    CallStatus::Success,
                    None,
                    Some(Utc::now()),
                );
                self.publish_outcome(record_id, caller_id, target_id, method, CallStatus::Success, None);
                Ok(value)
            }
            Err(err) => {
                self.finalize_record(
                    record_id,
                    caller_id,
                    target_id,
                    CallStatus::Error,
                    Some(err.to_string()),
                    Some(Utc::now()),
                );
                self.publish_outcome(record_id, caller_id, target_id, method, CallStatus::Error, Some(&err));
                Err(err)
            }
        }
    }

    fn validate_call(&self, caller_id: &str, target_id: &str) -> Result<()> {
        if caller_id.is_empty() || target_id.is_empty() {
            return Err(RuntimeError::InvalidArgument(
                "caller and target ids are required".into(),
            ));
        }
        if !self.registry.is_active(caller_id) {
            return Err(RuntimeError::CallerNotActive(caller_id.to_string()));
        }
        if !self.registry.is_active(target_id) {
            return Err(RuntimeError::TargetNotActive(target_id.to_string()));
        }
        // Plugin-level compatibility, coarser than the per-method check the
        // API registry applies underneath.
        if let Some(info) = self.conflicts.conflict_info(caller_id) {
            if let Some(entry) = info.involving(target_id) {
                return Err(RuntimeError::Incompatible {
                    a: caller_id.to_string(),
                    b: target_id.to_string(),
                    reason: entry.reason().unwrap_or("declared conflict").to_string(),
                });
            }
        }
        Ok(())
    }

    fn open_record(&self, caller_id: &str, target_id: &str, method: &str) -> RecordId {
        let record = CommunicationRecord {
            id: RecordId::new(),
            timestamp: Utc::now(),
            caller_id: caller_id.to_string(),
            target_id: target_id.to_string(),
            method_name: method.to_string(),
            status: CallStatus::Pending,
            error: None,
            completed_at: None,
        };
        let id = record.id;

        let mut histories = self.histories.lock().expect("history lock poisoned");
        let max = self.max_history_size;
        histories
            .entry(caller_id.to_string())
            .or_insert_with(|| RingLog::new(max))
            .push(record.clone());
        if target_id != caller_id {
            histories
                .entry(target_id.to_string())
                .or_insert_with(|| RingLog::new(max))
                .push(record);
        }
        id
    }

    fn finalize_record(
        &self,
        record_id: RecordId,
        caller_id: &str,
        target_id: &str,
        status: CallStatus,
        error: Option<String>,
        completed_at: Option<DateTime<Utc>>,
    ) {
        let mut histories = self.histories.lock().expect("history lock poisoned");
        for party in [caller_id, target_id] {
            if let Some(log) = histories.get_mut(party) {
                // The entry may already have been evicted; that is fine.
                if let Some(record) = log.iter_mut().find(|r| r.id == record_id) {
                    record.status = status;
                    record.error.clone_from(&error);
                    record.completed_at = completed_at;
                }
            }
        }
    }

    fn publish_outcome(
        &self,
        record_id: RecordId,
        caller_id: &str,
        target_id: &str,
        method: &str,
        status: CallStatus,
        error: Option<&RuntimeError>,
    ) {
        debug!(
            caller = %caller_id,
            target = %target_id,
            method = %method,
            success = matches!(status, CallStatus::Success),
            "Cross-plugin call completed"
        );
        self.bus.publish(
            topics::COMMS_OUTCOME,
            json!({
                "id": record_id.to_string(),
                "caller": caller_id,
                "target": target_id,
                "method": method,
                "status": status,
                "error": error.map(ToString::to_string),
            }),
        );
    }

    /// One plugin's call history (as caller or target), newest-first.
    #[must_use]
    pub fn communication_history(
        &self,
        plugin_id: &str,
        limit: Option<usize>,
    ) -> Vec<CommunicationRecord> {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .get(plugin_id)
            .map(|log| log.snapshot(limit))
            .unwrap_or_default()
    }

    // ================================================================
    // Channels (owned subsystem)
    // ================================================================

    pub fn create_channel(
        &self,
        name: &str,
        creator_id: &str,
        options: ChannelOptions,
    ) -> Result<ChannelHandle> {
        self.channels.create(name, creator_id, options)?;
        Ok(ChannelHandle::new(
            name,
            creator_id,
            Arc::clone(&self.channels),
        ))
    }

    /// A capability handle for an existing channel, scoped to `caller_id`.
    /// Does not transfer ownership. `None` when no such channel is open.
    #[must_use]
    pub fn get_channel(&self, caller_id: &str, name: &str) -> Option<ChannelHandle> {
        self.channels
            .contains(name)
            .then(|| ChannelHandle::new(name, caller_id, Arc::clone(&self.channels)))
    }

    pub fn subscribe_to_channel(
        &self,
        name: &str,
        plugin_id: &str,
        callback: SubscriberCallback,
    ) -> Result<SubscriptionHandle> {
        self.channels.subscribe(name, plugin_id, callback)?;
        Ok(SubscriptionHandle::new(
            name,
            plugin_id,
            Arc::clone(&self.channels),
        ))
    }

    pub fn publish_to_channel(
        &self,
        name: &str,
        publisher_id: &str,
        content: Value,
    ) -> Result<daybook_types::MessageId> {
        self.channels.publish(name, publisher_id, content)
    }

    pub fn close_channel(&self, name: &str, plugin_id: &str) -> Result<()> {
        self.channels.close(name, plugin_id)
    }

    #[must_use]
    pub fn list_channels(&self) -> Vec<crate::channels::ChannelInfo> {
        self.channels.list()
    }

    /// Direct access to the channel subsystem.
    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    // ================================================================
    // Teardown
    // ================================================================

    /// Releases everything a plugin holds in the communication layer:
    /// its call history, its subscriptions, and the channels it created.
    pub fn clear_plugin_resources(&self, plugin_id: &str) {
        self.histories
            .lock()
            .expect("history lock poisoned")
            .remove(plugin_id);
        self.channels.clear_plugin(plugin_id);
        debug!(plugin_id = %plugin_id, "Communication resources cleared");
    }
}
