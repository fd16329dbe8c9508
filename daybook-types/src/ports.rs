//! Collaborator traits consumed by the runtime.
//!
//! The runtime core never owns plugin installation state or the audit
//! transport; it queries a registry for manifests/liveness, a conflict index
//! for declared incompatibilities, and emits fire-and-forget audit events to
//! whatever bus the host wires in.

use crate::manifest::{ConflictInfo, PluginManifest};
use serde_json::Value;

/// Plugin metadata and active-state queries.
pub trait PluginRegistry: Send + Sync {
    /// The installed manifest for `id`, if any.
    fn manifest(&self, id: &str) -> Option<PluginManifest>;

    /// Whether `id` is installed and currently active.
    fn is_active(&self, id: &str) -> bool;

    /// Ids of all currently active plugins.
    fn active_ids(&self) -> Vec<String>;
}

/// Declared-conflict lookup across the installed set.
pub trait ConflictLookup: Send + Sync {
    /// Conflict declarations touching `id`, from both directions.
    /// `None` when the plugin is unknown or nothing references it.
    fn conflict_info(&self, id: &str) -> Option<ConflictInfo>;
}

/// Fire-and-forget pub/sub used for audit and telemetry.
///
/// Publishing never fails and never blocks the caller; delivery is
/// best-effort and unacknowledged.
pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: Value);
}

/// Audit/telemetry topics emitted by the runtime. These names are a wire
/// contract for observers; changing one is a breaking change.
pub mod topics {
    pub const API_REGISTERED: &str = "plugin.api.registered";
    pub const API_UNREGISTERED: &str = "plugin.api.unregistered";
    pub const API_UNAUTHORIZED: &str = "plugin.api.unauthorized";
    pub const API_ERROR: &str = "plugin.api.error";
    pub const COMMS_OUTCOME: &str = "plugin.comms.outcome";
    pub const CHANNEL_CREATED: &str = "plugin.channel.created";
    pub const CHANNEL_SUBSCRIBED: &str = "plugin.channel.subscribed";
    pub const CHANNEL_UNSUBSCRIBED: &str = "plugin.channel.unsubscribed";
    pub const CHANNEL_CLOSED: &str = "plugin.channel.closed";
    pub const PLUGIN_ERROR: &str = "plugin.error";
    pub const SANDBOX_ERROR: &str = "sandbox.error";
    pub const SECURITY_LEVEL_CHANGED: &str = "sandbox.security_level_changed";
    pub const SUSPICIOUS_OPERATION: &str = "sandbox.suspicious_operation";
    pub const SENSITIVE_ACCESS: &str = "sandbox.sensitive_access_attempt";
}
