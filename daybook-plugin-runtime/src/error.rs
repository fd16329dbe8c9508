//! Error types for the plugin runtime.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("plugin not found: {0}")]
    PluginNotFound(String),

    #[error("caller plugin not active: {0}")]
    CallerNotActive(String),

    #[error("target plugin not active: {0}")]
    TargetNotActive(String),

    #[error("plugin '{0}' has no registered API")]
    ApiNotRegistered(String),

    #[error("plugin '{plugin_id}' exposes no method '{method}'")]
    MethodNotFound { plugin_id: String, method: String },

    #[error("access denied: '{caller}' may not call '{target}.{method}'")]
    AccessDenied {
        caller: String,
        target: String,
        method: String,
    },

    #[error("plugins '{a}' and '{b}' are incompatible: {reason}")]
    Incompatible {
        a: String,
        b: String,
        reason: String,
    },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("channel already exists: {0}")]
    ChannelExists(String),

    #[error("publish denied: '{publisher}' may not publish to channel '{channel}'")]
    PublishDenied { publisher: String, channel: String },

    #[error("close denied: '{plugin_id}' is not the creator of channel '{channel}'")]
    CloseDenied { plugin_id: String, channel: String },

    #[error("timeout: plugin '{plugin_id}' exceeded {timeout_ms}ms deadline")]
    Timeout { plugin_id: String, timeout_ms: u64 },

    #[error("write to '{property}' blocked for plugin '{plugin_id}': content looks executable")]
    BlockedWrite {
        plugin_id: String,
        property: String,
    },

    #[error("unknown security level: {0}")]
    UnknownSecurityLevel(String),

    #[error("plugin '{plugin_id}' failed during '{operation}': {source}")]
    PluginFailure {
        plugin_id: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("storage error: {0}")]
    Storage(String),
}

impl RuntimeError {
    /// Wraps an arbitrary plugin-body failure, preserving the original error
    /// as the source.
    pub fn plugin_failure(
        plugin_id: impl Into<String>,
        operation: impl Into<String>,
        source: anyhow::Error,
    ) -> Self {
        Self::PluginFailure {
            plugin_id: plugin_id.into(),
            operation: operation.into(),
            source: source.into(),
        }
    }
}

impl From<daybook_storage::StorageError> for RuntimeError {
    fn from(err: daybook_storage::StorageError) -> Self {
        Self::Storage(err.to_string())
    }
}
