//! API registry: capability-scoped method exposure between plugins.
//!
//! A plugin publishes its callable surface as a `PluginApi` implementation.
//! The registry never hands the raw object to anyone; every invocation goes
//! through an access check keyed on (caller, target, method), with the
//! decision memoized for the process lifetime until the plugin is removed.
//!
//! Policy, evaluated in order on a cache miss:
//! 1. self-calls and the privileged application identity are permitted
//! 2. denied if either side is inactive
//! 3. permitted if the caller declares the target as a dependency
//! 4. denied if either side declares a conflict naming the other
//! 5. otherwise permitted — the policy is opt-out, not opt-in

use crate::error::{Result, RuntimeError};
use crate::reporter::ErrorReporter;
use chrono::{DateTime, Utc};
use daybook_types::{topics, ActorId, ConflictLookup, EventBus, PluginRegistry, RecordId, RingLog};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// A plugin's callable surface, declared once at registration time.
pub trait PluginApi: Send + Sync {
    /// The methods this API exposes.
    fn method_names(&self) -> Vec<String>;

    /// Invokes one method. Failures are arbitrary plugin-side errors.
    fn invoke(&self, method: &str, args: &[Value]) -> anyhow::Result<Value>;
}

type MethodHandler = Box<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// A name-to-handler table, the common way to assemble a `PluginApi`.
#[derive(Default)]
pub struct MethodTable {
    methods: BTreeMap<String, MethodHandler>,
}

impl MethodTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a method, replacing any previous handler with the same name.
    #[must_use]
    pub fn method(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl PluginApi for MethodTable {
    fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    fn invoke(&self, method: &str, args: &[Value]) -> anyhow::Result<Value> {
        match self.methods.get(method) {
            Some(handler) => handler(args),
            None => anyhow::bail!("no such method: {method}"),
        }
    }
}

/// One live registration per plugin id.
#[derive(Clone)]
pub struct ApiRegistration {
    pub plugin_id: String,
    pub method_names: Vec<String>,
    pub registered_at: DateTime<Utc>,
    api: Arc<dyn PluginApi>,
}

/// One access attempt, success or denial, in a caller's log.
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub id: RecordId,
    pub timestamp: DateTime<Utc>,
    pub caller: String,
    pub target: String,
    pub method: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DecisionKey {
    caller: String,
    target: String,
    method: String,
}

struct RegistryState {
    registrations: HashMap<String, ApiRegistration>,
    decisions: HashMap<DecisionKey, bool>,
    access_logs: HashMap<String, RingLog<AccessLogEntry>>,
}

/// Registers plugin APIs and mediates every cross-plugin method call.
pub struct ApiRegistry {
    registry: Arc<dyn PluginRegistry>,
    conflicts: Arc<dyn ConflictLookup>,
    reporter: Arc<ErrorReporter>,
    bus: Arc<dyn EventBus>,
    max_log_size: usize,
    state: Mutex<RegistryState>,
}

impl ApiRegistry {
    #[must_use]
    pub fn new(
        registry: Arc<dyn PluginRegistry>,
        conflicts: Arc<dyn ConflictLookup>,
        reporter: Arc<ErrorReporter>,
        bus: Arc<dyn EventBus>,
        max_log_size: usize,
    ) -> Self {
        Self {
            registry,
            conflicts,
            reporter,
            bus,
            max_log_size,
            state: Mutex::new(RegistryState {
                registrations: HashMap::new(),
                decisions: HashMap::new(),
                access_logs: HashMap::new(),
            }),
        }
    }

    // ================================================================
    // Registration
    // ================================================================

    /// Registers a plugin's API. Fails if the plugin is unknown to the
    /// registry; re-registration overwrites with a warning.
    pub fn register_api(&self, plugin_id: &str, api: Arc<dyn PluginApi>) -> Result<()> {
        if self.registry.manifest(plugin_id).is_none() {
            return Err(RuntimeError::PluginNotFound(plugin_id.to_string()));
        }

        let method_names = api.method_names();
        let registration = ApiRegistration {
            plugin_id: plugin_id.to_string(),
            method_names: method_names.clone(),
            registered_at: Utc::now(),
            api,
        };

        let mut state = self.state.lock().expect("registry lock poisoned");
        if state
            .registrations
            .insert(plugin_id.to_string(), registration)
            .is_some()
        {
            warn!(plugin_id = %plugin_id, "API re-registered, previous registration overwritten");
        } else {
            info!(plugin_id = %plugin_id, methods = method_names.len(), "API registered");
        }
        drop(state);

        self.bus.publish(
            topics::API_REGISTERED,
            json!({ "plugin_id": plugin_id, "methods": method_names }),
        );
        Ok(())
    }

    /// Removes a plugin's registration and purges every memoized decision
    /// referencing it. Returns whether a registration existed.
    pub fn unregister_api(&self, plugin_id: &str) -> bool {
        let mut state = self.state.lock().expect("registry lock poisoned");
        let existed = state.registrations.remove(plugin_id).is_some();
        state
            .decisions
            .retain(|key, _| key.caller != plugin_id && key.target != plugin_id);
        drop(state);

        if existed {
            info!(plugin_id = %plugin_id, "API unregistered");
            self.bus
                .publish(topics::API_UNREGISTERED, json!({ "plugin_id": plugin_id }));
        }
        existed
    }

    /// Bulk teardown for one plugin: unregisters its API and drops the
    /// access log it accumulated as a caller. Used on deactivation.
    pub fn clear_plugin(&self, plugin_id: &str) {
        self.unregister_api(plugin_id);
        self.state
            .lock()
            .expect("registry lock poisoned")
            .access_logs
            .remove(plugin_id);
    }

    /// Drops every registration, decision, and access log.
    pub fn clear_all(&self) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        state.registrations.clear();
        state.decisions.clear();
        state.access_logs.clear();
    }

    /// The live registration for a plugin, if any.
    #[must_use]
    pub fn registration(&self, plugin_id: &str) -> Option<ApiRegistration> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .registrations
            .get(plugin_id)
            .cloned()
    }

    // ================================================================
    // Invocation
    // ================================================================

    /// Invokes `target.method(args)` on behalf of `caller`.
    ///
    /// The caller identity travels with the call; there is no ambient
    /// "current caller" state. A denied call is logged, audited, and
    /// surfaced as `AccessDenied`; a plugin-body failure is reported with
    /// caller context and re-thrown.
    pub fn call_plugin_method(
        &self,
        caller: &ActorId,
        target: &str,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        if method.is_empty() {
            return Err(RuntimeError::InvalidArgument("method name is empty".into()));
        }

        // Resolve the wrapped API before any side effect. The handler Arc is
        // cloned out so the lock is not held across plugin code.
        let api = {
            let state = self.state.lock().expect("registry lock poisoned");
            let registration = state
                .registrations
                .get(target)
                .ok_or_else(|| RuntimeError::ApiNotRegistered(target.to_string()))?;
            if !registration.method_names.iter().any(|m| m == method) {
                return Err(RuntimeError::MethodNotFound {
                    plugin_id: target.to_string(),
                    method: method.to_string(),
                });
            }
            Arc::clone(&registration.api)
        };

        if !self.check_api_access(caller, target, method) {
            let err = RuntimeError::AccessDenied {
                caller: caller.to_string(),
                target: target.to_string(),
                method: method.to_string(),
            };
            self.log_access(caller, target, method, false, Some(err.to_string()));
            self.bus.publish(
                topics::API_UNAUTHORIZED,
                json!({
                    "caller": caller.as_str(),
                    "target": target,
                    "method": method,
                }),
            );
            return Err(err);
        }

        self.log_access(caller, target, method, true, None);
        debug!(caller = %caller, target = %target, method = %method, "API call dispatched");

        match api.invoke(method, args) {
            Ok(value) => Ok(value),
            Err(err) => {
                self.reporter.report_message(
                    Some(target),
                    &format!("api:{method}"),
                    err.to_string(),
                    json!({ "caller": caller.as_str() }),
                );
                self.bus.publish(
                    topics::API_ERROR,
                    json!({
                        "caller": caller.as_str(),
                        "target": target,
                        "method": method,
                        "error": err.to_string(),
                    }),
                );
                Err(RuntimeError::plugin_failure(target, format!("api:{method}"), err))
            }
        }
    }

    /// Evaluates (and memoizes) whether `caller` may invoke
    /// `target.method`. See the module docs for the policy order.
    pub fn check_api_access(&self, caller: &ActorId, target: &str, method: &str) -> bool {
        // Self-calls and the application identity bypass the policy and are
        // never memoized.
        if caller.is_app() || caller.as_str() == target {
            return true;
        }

        let key = DecisionKey {
            caller: caller.as_str().to_string(),
            target: target.to_string(),
            method: method.to_string(),
        };

        if let Some(&decision) = self
            .state
            .lock()
            .expect("registry lock poisoned")
            .decisions
            .get(&key)
        {
            return decision;
        }

        let decision = self.derive_access(caller.as_str(), target);
        self.state
            .lock()
            .expect("registry lock poisoned")
            .decisions
            .insert(key, decision);
        decision
    }

    fn derive_access(&self, caller: &str, target: &str) -> bool {
        if !self.registry.is_active(caller) || !self.registry.is_active(target) {
            debug!(caller = %caller, target = %target, "Access denied: inactive party");
            return false;
        }

        if let Some(manifest) = self.registry.manifest(caller) {
            if manifest.depends_on(target) {
                debug!(caller = %caller, target = %target, "Access granted: declared dependency");
                return true;
            }
        }

        // Conflicts are checked in both directions; the reversed list covers
        // declarations the target made against the caller.
        if let Some(info) = self.conflicts.conflict_info(caller) {
            if info.involving(target).is_some() {
                debug!(caller = %caller, target = %target, "Access denied: declared conflict");
                return false;
            }
        }

        // No declared relationship either way: permitted. The policy is
        // opt-out; a plugin excludes callers via conflict declarations.
        true
    }

    // ================================================================
    // Access log
    // ================================================================

    fn log_access(
        &self,
        caller: &ActorId,
        target: &str,
        method: &str,
        success: bool,
        error: Option<String>,
    ) {
        let entry = AccessLogEntry {
            id: RecordId::new(),
            timestamp: Utc::now(),
            caller: caller.as_str().to_string(),
            target: target.to_string(),
            method: method.to_string(),
            success,
            error,
        };
        let mut state = self.state.lock().expect("registry lock poisoned");
        let max = self.max_log_size;
        state
            .access_logs
            .entry(entry.caller.clone())
            .or_insert_with(|| RingLog::new(max))
            .push(entry);
    }

    /// A caller's access attempts, newest-first, optionally limited.
    #[must_use]
    pub fn access_log(&self, caller: &ActorId, limit: Option<usize>) -> Vec<AccessLogEntry> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .access_logs
            .get(caller.as_str())
            .map(|log| log.snapshot(limit))
            .unwrap_or_default()
    }

    /// Number of memoized access decisions (diagnostic).
    #[must_use]
    pub fn cached_decision_count(&self) -> usize {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .decisions
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use daybook_types::{ConflictInfo, ConflictRef, PluginManifest};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Registry double that counts lookups, for memoization assertions.
    struct CountingRegistry {
        plugins: Vec<PluginManifest>,
        inactive: Vec<String>,
        lookups: AtomicUsize,
    }

    impl CountingRegistry {
        fn with(plugins: Vec<PluginManifest>) -> Self {
            Self {
                plugins,
                inactive: Vec::new(),
                lookups: AtomicUsize::new(0),
            }
        }

        fn lookup_count(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    impl PluginRegistry for CountingRegistry {
        fn manifest(&self, id: &str) -> Option<PluginManifest> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.plugins.iter().find(|m| m.id == id).cloned()
        }

        fn is_active(&self, id: &str) -> bool {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.plugins.iter().any(|m| m.id == id) && !self.inactive.iter().any(|i| i == id)
        }

        fn active_ids(&self) -> Vec<String> {
            self.plugins.iter().map(|m| m.id.clone()).collect()
        }
    }

    struct CountingConflicts {
        conflicts: Vec<(String, ConflictInfo)>,
        lookups: AtomicUsize,
    }

    impl CountingConflicts {
        fn empty() -> Self {
            Self {
                conflicts: Vec::new(),
                lookups: AtomicUsize::new(0),
            }
        }

        fn lookup_count(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }
    }

    impl ConflictLookup for CountingConflicts {
        fn conflict_info(&self, id: &str) -> Option<ConflictInfo> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.conflicts
                .iter()
                .find(|(cid, _)| cid == id)
                .map(|(_, info)| info.clone())
        }
    }

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest {
            id: id.into(),
            name: format!("Test {id}"),
            version: "1.0.0".into(),
            author: "test".into(),
            description: String::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            hooks: Default::default(),
        }
    }

    fn echo_api() -> Arc<dyn PluginApi> {
        Arc::new(
            MethodTable::new()
                .method("echo", |args| Ok(args.first().cloned().unwrap_or(Value::Null)))
                .method("fail", |_| anyhow::bail!("intentional failure")),
        )
    }

    struct Fixture {
        registry: Arc<CountingRegistry>,
        conflicts: Arc<CountingConflicts>,
        bus: Arc<MemoryBus>,
        apis: ApiRegistry,
    }

    fn fixture(plugins: Vec<PluginManifest>) -> Fixture {
        let registry = Arc::new(CountingRegistry::with(plugins));
        let conflicts = Arc::new(CountingConflicts::empty());
        let bus = Arc::new(MemoryBus::new());
        let reporter = Arc::new(ErrorReporter::new(
            Arc::clone(&bus) as Arc<dyn EventBus>,
            10,
        ));
        let apis = ApiRegistry::new(
            Arc::clone(&registry) as Arc<dyn PluginRegistry>,
            Arc::clone(&conflicts) as Arc<dyn ConflictLookup>,
            reporter,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            3,
        );
        Fixture {
            registry,
            conflicts,
            bus,
            apis,
        }
    }

    // ================================================================
    // Registration
    // ================================================================

    #[test]
    fn register_unknown_plugin_fails() {
        let f = fixture(vec![]);
        let err = f.apis.register_api("ghost", echo_api()).unwrap_err();
        assert!(matches!(err, RuntimeError::PluginNotFound(_)));
    }

    #[test]
    fn register_publishes_audit_event() {
        let f = fixture(vec![manifest("a")]);
        f.apis.register_api("a", echo_api()).unwrap();
        let events = f.bus.events_for(topics::API_REGISTERED);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["plugin_id"], "a");
    }

    #[test]
    fn re_registration_overwrites() {
        let f = fixture(vec![manifest("a")]);
        f.apis.register_api("a", echo_api()).unwrap();
        f.apis
            .register_api("a", Arc::new(MethodTable::new().method("only", |_| Ok(Value::Null))))
            .unwrap();

        let reg = f.apis.registration("a").unwrap();
        assert_eq!(reg.method_names, vec!["only"]);
    }

    // ================================================================
    // Invocation and policy
    // ================================================================

    #[test]
    fn app_identity_always_permitted() {
        let f = fixture(vec![manifest("a")]);
        f.apis.register_api("a", echo_api()).unwrap();
        let result = f
            .apis
            .call_plugin_method(&ActorId::App, "a", "echo", &[json!(42)])
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn unregistered_target_is_not_found() {
        let f = fixture(vec![manifest("a")]);
        let err = f
            .apis
            .call_plugin_method(&ActorId::App, "a", "echo", &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ApiNotRegistered(_)));
    }

    #[test]
    fn unknown_method_is_rejected() {
        let f = fixture(vec![manifest("a")]);
        f.apis.register_api("a", echo_api()).unwrap();
        let err = f
            .apis
            .call_plugin_method(&ActorId::App, "a", "nope", &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::MethodNotFound { .. }));
    }

    #[test]
    fn default_allow_for_unrelated_active_plugins() {
        let f = fixture(vec![manifest("a"), manifest("b")]);
        f.apis.register_api("b", echo_api()).unwrap();
        let result = f
            .apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "echo", &[json!("hi")])
            .unwrap();
        assert_eq!(result, json!("hi"));
    }

    #[test]
    fn inactive_party_denied() {
        let mut registry = CountingRegistry::with(vec![manifest("a"), manifest("b")]);
        registry.inactive.push("a".into());
        let registry = Arc::new(registry);
        let conflicts = Arc::new(CountingConflicts::empty());
        let bus = Arc::new(MemoryBus::new());
        let reporter = Arc::new(ErrorReporter::new(Arc::clone(&bus) as Arc<dyn EventBus>, 10));
        let apis = ApiRegistry::new(
            Arc::clone(&registry) as Arc<dyn PluginRegistry>,
            conflicts,
            reporter,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            3,
        );

        apis.register_api("b", echo_api()).unwrap();
        let err = apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "echo", &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AccessDenied { .. }));
        assert_eq!(bus.events_for(topics::API_UNAUTHORIZED).len(), 1);
    }

    #[test]
    fn declared_conflict_denied_in_reverse_direction() {
        // b declares a conflict against a; a calling b must be denied via
        // the reversed index.
        let registry = Arc::new(CountingRegistry::with(vec![manifest("a"), manifest("b")]));
        let conflicts = Arc::new(CountingConflicts {
            conflicts: vec![(
                "a".into(),
                ConflictInfo {
                    declared: Vec::new(),
                    reversed: vec![ConflictRef::Annotated {
                        id: "b".into(),
                        reason: "storage clash".into(),
                    }],
                },
            )],
            lookups: AtomicUsize::new(0),
        });
        let bus = Arc::new(MemoryBus::new());
        let reporter = Arc::new(ErrorReporter::new(Arc::clone(&bus) as Arc<dyn EventBus>, 10));
        let apis = ApiRegistry::new(
            registry,
            conflicts,
            reporter,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            3,
        );

        apis.register_api("b", echo_api()).unwrap();
        let err = apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "echo", &[])
            .unwrap_err();
        assert!(err.to_string().contains("a"));
        assert!(matches!(err, RuntimeError::AccessDenied { .. }));
    }

    #[test]
    fn decision_is_memoized_without_re_deriving() {
        let f = fixture(vec![manifest("a"), manifest("b")]);
        f.apis.register_api("b", echo_api()).unwrap();

        f.apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "echo", &[])
            .unwrap();
        let registry_lookups = f.registry.lookup_count();
        let conflict_lookups = f.conflicts.lookup_count();

        f.apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "echo", &[])
            .unwrap();
        assert_eq!(f.registry.lookup_count(), registry_lookups);
        assert_eq!(f.conflicts.lookup_count(), conflict_lookups);
        assert_eq!(f.apis.cached_decision_count(), 1);
    }

    #[test]
    fn unregister_purges_decisions() {
        let f = fixture(vec![manifest("a"), manifest("b")]);
        f.apis.register_api("b", echo_api()).unwrap();
        f.apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "echo", &[])
            .unwrap();
        assert_eq!(f.apis.cached_decision_count(), 1);

        assert!(f.apis.unregister_api("b"));
        assert_eq!(f.apis.cached_decision_count(), 0);
        assert!(f.apis.registration("b").is_none());
    }

    #[test]
    fn method_failure_is_reported_and_rethrown() {
        let f = fixture(vec![manifest("a"), manifest("b")]);
        f.apis.register_api("b", echo_api()).unwrap();
        let err = f
            .apis
            .call_plugin_method(&ActorId::plugin("a"), "b", "fail", &[])
            .unwrap_err();
        assert!(matches!(err, RuntimeError::PluginFailure { .. }));
        assert!(err.to_string().contains("intentional failure"));
        assert_eq!(f.bus.events_for(topics::API_ERROR).len(), 1);
    }

    // ================================================================
    // Access log
    // ================================================================

    #[test]
    fn access_log_caps_newest_first() {
        let f = fixture(vec![manifest("a"), manifest("b")]);
        f.apis.register_api("b", echo_api()).unwrap();
        let caller = ActorId::plugin("a");

        for _ in 0..5 {
            f.apis.call_plugin_method(&caller, "b", "echo", &[]).unwrap();
        }

        // max_log_size is 3 in the fixture
        let log = f.apis.access_log(&caller, None);
        assert_eq!(log.len(), 3);
        assert!(log.iter().all(|e| e.success));
        assert!(log[0].timestamp >= log[2].timestamp);
    }

    #[test]
    fn denied_attempts_are_logged() {
        let mut registry = CountingRegistry::with(vec![manifest("a"), manifest("b")]);
        registry.inactive.push("b".into());
        let registry = Arc::new(registry);
        let bus = Arc::new(MemoryBus::new());
        let reporter = Arc::new(ErrorReporter::new(Arc::clone(&bus) as Arc<dyn EventBus>, 10));
        let apis = ApiRegistry::new(
            registry,
            Arc::new(CountingConflicts::empty()),
            reporter,
            Arc::clone(&bus) as Arc<dyn EventBus>,
            3,
        );
        apis.register_api("b", echo_api()).unwrap();

        let caller = ActorId::plugin("a");
        apis.call_plugin_method(&caller, "b", "echo", &[]).unwrap_err();

        let log = apis.access_log(&caller, None);
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
        assert!(log[0].error.as_deref().unwrap().contains("access denied"));
    }
}
