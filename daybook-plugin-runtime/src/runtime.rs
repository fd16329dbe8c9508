//! Wiring for the full runtime: one constructor that assembles the error
//! reporter, API registry, communication hub, sandbox, and host surface
//! around the collaborators the application provides.

use crate::access::ApiRegistry;
use crate::comms::CommsHub;
use crate::config::RuntimeConfig;
use crate::host::HostApi;
use crate::reporter::ErrorReporter;
use crate::sandbox::Sandbox;
use daybook_storage::KvStore;
use daybook_types::{ConflictLookup, EventBus, PluginRegistry};
use std::sync::Arc;

/// The assembled plugin trust-and-communication runtime.
///
/// Must be constructed inside a Tokio runtime; the sandbox captures the
/// current handle at construction time.
pub struct PluginRuntime {
    reporter: Arc<ErrorReporter>,
    apis: Arc<ApiRegistry>,
    comms: Arc<CommsHub>,
    sandbox: Arc<Sandbox>,
    host: Arc<HostApi>,
}

impl PluginRuntime {
    #[must_use]
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        conflicts: Arc<dyn ConflictLookup>,
        bus: Arc<dyn EventBus>,
        storage: Arc<KvStore>,
        config: RuntimeConfig,
    ) -> Self {
        let reporter = Arc::new(ErrorReporter::new(Arc::clone(&bus), config.max_log_size));
        let apis = Arc::new(ApiRegistry::new(
            Arc::clone(&registry),
            Arc::clone(&conflicts),
            Arc::clone(&reporter),
            Arc::clone(&bus),
            config.max_log_size,
        ));
        let comms = Arc::new(CommsHub::new(
            Arc::clone(&registry),
            Arc::clone(&conflicts),
            Arc::clone(&apis),
            Arc::clone(&reporter),
            Arc::clone(&bus),
            config.max_history_size,
        ));
        let sandbox = Arc::new(Sandbox::new(
            config.security_level,
            Arc::clone(&reporter),
            Arc::clone(&bus),
        ));
        let host = Arc::new(HostApi::new(
            registry,
            Arc::clone(&apis),
            Arc::clone(&comms),
            storage,
        ));

        Self {
            reporter,
            apis,
            comms,
            sandbox,
            host,
        }
    }

    #[must_use]
    pub fn reporter(&self) -> &Arc<ErrorReporter> {
        &self.reporter
    }

    #[must_use]
    pub fn apis(&self) -> &Arc<ApiRegistry> {
        &self.apis
    }

    #[must_use]
    pub fn comms(&self) -> &Arc<CommsHub> {
        &self.comms
    }

    #[must_use]
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    #[must_use]
    pub fn host(&self) -> &Arc<HostApi> {
        &self.host
    }

    /// Full teardown for one plugin: API registration, permission cache,
    /// access log, communication history, subscriptions, owned channels.
    pub fn release_plugin(&self, plugin_id: &str) {
        self.comms.clear_plugin_resources(plugin_id);
        self.apis.clear_plugin(plugin_id);
    }
}
