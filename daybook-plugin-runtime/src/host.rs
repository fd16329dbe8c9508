//! The capability surface handed to extension code.
//!
//! Thin pass-throughs over the runtime components: everything here either
//! delegates to the API registry / communication hub or exposes read-only
//! registry metadata. The one piece of state the host surface owns is
//! plugin-scoped settings storage, namespaced per plugin in the key-value
//! backend.

use crate::access::{ApiRegistry, PluginApi};
use crate::channels::{ChannelHandle, ChannelInfo, ChannelOptions};
use crate::comms::CommsHub;
use crate::error::Result;
use daybook_storage::KvStore;
use daybook_types::{PluginInfo, PluginRegistry};
use serde_json::Value;
use std::sync::Arc;

/// The `plugins.*` surface consumed by extension code.
pub struct HostApi {
    registry: Arc<dyn PluginRegistry>,
    apis: Arc<ApiRegistry>,
    comms: Arc<CommsHub>,
    storage: Arc<KvStore>,
}

impl HostApi {
    #[must_use]
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        apis: Arc<ApiRegistry>,
        comms: Arc<CommsHub>,
        storage: Arc<KvStore>,
    ) -> Self {
        Self {
            registry,
            apis,
            comms,
            storage,
        }
    }

    // ================================================================
    // Registry pass-throughs
    // ================================================================

    #[must_use]
    pub fn get_plugin(&self, id: &str) -> Option<PluginInfo> {
        self.registry
            .manifest(id)
            .map(|m| PluginInfo::from_manifest(&m, self.registry.is_active(id)))
    }

    #[must_use]
    pub fn get_active_plugins(&self) -> Vec<PluginInfo> {
        self.registry
            .active_ids()
            .iter()
            .filter_map(|id| self.get_plugin(id))
            .collect()
    }

    #[must_use]
    pub fn is_plugin_active(&self, id: &str) -> bool {
        self.registry.is_active(id)
    }

    // ================================================================
    // API exposure
    // ================================================================

    pub fn register_api(&self, plugin_id: &str, api: Arc<dyn PluginApi>) -> Result<()> {
        self.apis.register_api(plugin_id, api)
    }

    /// A capability handle for calling `target_id`'s API on behalf of
    /// `caller_id`. Calls are routed through the communication hub and the
    /// access-checked registry underneath; the raw API object is never
    /// exposed. `None` when the target has not registered an API.
    #[must_use]
    pub fn get_plugin_api(&self, caller_id: &str, target_id: &str) -> Option<PluginApiHandle> {
        let registration = self.apis.registration(target_id)?;
        Some(PluginApiHandle {
            caller_id: caller_id.to_string(),
            target_id: target_id.to_string(),
            method_names: registration.method_names,
            comms: Arc::clone(&self.comms),
        })
    }

    // ================================================================
    // Channels
    // ================================================================

    pub fn create_channel(
        &self,
        name: &str,
        caller_id: &str,
        options: ChannelOptions,
    ) -> Result<ChannelHandle> {
        self.comms.create_channel(name, caller_id, options)
    }

    #[must_use]
    pub fn get_channel(&self, caller_id: &str, name: &str) -> Option<ChannelHandle> {
        self.comms.get_channel(caller_id, name)
    }

    #[must_use]
    pub fn list_channels(&self) -> Vec<ChannelInfo> {
        self.comms.list_channels()
    }

    // ================================================================
    // Plugin-scoped settings storage
    // ================================================================

    pub async fn plugin_storage_get(&self, plugin_id: &str, key: &str) -> Result<Option<String>> {
        Ok(self.storage.get(&storage_key(plugin_id, key)).await?)
    }

    pub async fn plugin_storage_set(&self, plugin_id: &str, key: &str, value: &str) -> Result<()> {
        Ok(self.storage.put(&storage_key(plugin_id, key), value).await?)
    }

    pub async fn plugin_storage_remove(&self, plugin_id: &str, key: &str) -> Result<bool> {
        Ok(self.storage.remove(&storage_key(plugin_id, key)).await?)
    }

    /// Drops every stored key for a plugin. Part of deactivation teardown.
    pub async fn plugin_storage_clear(&self, plugin_id: &str) -> Result<usize> {
        Ok(self
            .storage
            .clear_prefix(&format!("plugin/{plugin_id}/"))
            .await?)
    }
}

fn storage_key(plugin_id: &str, key: &str) -> String {
    format!("plugin/{plugin_id}/{key}")
}

/// Capability handle over one plugin's registered API, scoped to a caller.
///
/// Method calls go through the orchestrated path: history recording,
/// liveness/compatibility validation, then the access-checked invocation.
#[derive(Clone)]
pub struct PluginApiHandle {
    caller_id: String,
    target_id: String,
    method_names: Vec<String>,
    comms: Arc<CommsHub>,
}

impl PluginApiHandle {
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target_id
    }

    /// Methods the target declared at registration time.
    #[must_use]
    pub fn method_names(&self) -> &[String] {
        &self.method_names
    }

    pub fn call(&self, method: &str, args: &[Value]) -> Result<Value> {
        self.comms
            .call_plugin_method(&self.caller_id, &self.target_id, method, args)
    }
}
