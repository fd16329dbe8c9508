//! Supervised execution context for plugin code.
//!
//! Three concerns live here:
//! - static auditing of plugin hook sources against a severity-tagged rule
//!   set, with the failure threshold tuned by the active security level;
//! - deadline-bounded execution of plugin-supplied work, where a timeout
//!   abandons the wrapper's result but does not halt the underlying task;
//! - interception of writes to markup-bearing surface properties.
//!
//! The static audit is an advisory heuristic, not a hard boundary: it
//! matches patterns in source text and cannot see through minification or
//! dynamically assembled code. It exists as defense-in-depth in front of
//! the runtime checks.

use crate::error::{Result, RuntimeError};
use crate::reporter::{ErrorRecord, ErrorReporter};
use daybook_types::{topics, EventBus, PluginManifest};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Ordered security levels. Stricter levels shorten the execution deadline
/// and lower the violation severity needed to fail validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Normal,
    High,
}

impl SecurityLevel {
    /// Millisecond budget for one sandboxed execution.
    #[must_use]
    pub const fn execution_deadline_ms(&self) -> u64 {
        match self {
            Self::Low => 10_000,
            Self::Normal => 5_000,
            Self::High => 2_000,
        }
    }

    /// Whether a violation of the given severity fails validation at this
    /// level.
    #[must_use]
    pub fn fails_on(&self, severity: Severity) -> bool {
        match self {
            Self::Low => severity == Severity::Critical,
            Self::Normal => severity >= Severity::Medium,
            Self::High => true,
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        };
        f.write_str(name)
    }
}

impl FromStr for SecurityLevel {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(RuntimeError::UnknownSecurityLevel(other.to_string())),
        }
    }
}

/// Severity of a static-analysis finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    Critical,
}

/// One rule the static audit applies to hook sources.
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub name: &'static str,
    pub severity: Severity,
    /// Lowercased substrings that trigger the rule.
    pub patterns: &'static [&'static str],
}

/// The built-in rule set. Patterns target the script dialect plugin hooks
/// are written in.
const BUILTIN_RULES: &[ValidationRule] = &[
    ValidationRule {
        name: "dynamic-code-execution",
        severity: Severity::Critical,
        patterns: &["eval(", "new function("],
    },
    ValidationRule {
        name: "string-timer-eval",
        severity: Severity::Critical,
        patterns: &["settimeout(\"", "settimeout('", "setinterval(\"", "setinterval('"],
    },
    ValidationRule {
        name: "markup-injection",
        severity: Severity::Medium,
        patterns: &["innerhtml", "outerhtml", "document.write("],
    },
    ValidationRule {
        name: "script-url",
        severity: Severity::Medium,
        patterns: &["javascript:"],
    },
    ValidationRule {
        name: "global-scope-escape",
        severity: Severity::Low,
        patterns: &["globalthis", "window.top"],
    },
];

/// A structured static-analysis finding. Data, not an exception.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub rule: String,
    pub severity: Severity,
    /// The pattern occurrence that triggered the rule.
    pub matched: Option<String>,
}

/// Outcome of auditing one plugin descriptor.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub violations: Vec<Violation>,
}

/// Aggregate sandbox health, ranked by worst offenders.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxStats {
    pub sandboxed_plugins: usize,
    pub plugins_with_errors: usize,
    pub total_errors: usize,
    pub worst_offenders: Vec<OffenderStat>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OffenderStat {
    pub plugin_id: String,
    pub error_count: usize,
}

struct SandboxState {
    level: SecurityLevel,
    /// Rules added by the host on top of the built-in set.
    extra_rules: Vec<ValidationRule>,
    /// Once the strictest level has been applied the rule set is sealed
    /// and stays sealed even if the level is later lowered.
    rules_locked: bool,
    executed: HashSet<String>,
    errors: HashMap<String, Vec<ErrorRecord>>,
}

/// The supervised execution context.
///
/// Construction captures the current Tokio runtime handle and an epoch
/// instant *before* any plugin code runs, so later plugin activity cannot
/// swap the scheduling primitives underneath the sandbox. Must therefore be
/// created inside a Tokio runtime.
pub struct Sandbox {
    reporter: Arc<ErrorReporter>,
    bus: Arc<dyn EventBus>,
    runtime: tokio::runtime::Handle,
    epoch: Instant,
    state: Mutex<SandboxState>,
}

impl Sandbox {
    #[must_use]
    pub fn new(
        level: SecurityLevel,
        reporter: Arc<ErrorReporter>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        let rules_locked = level == SecurityLevel::High;
        info!(level = %level, "Sandbox initialized");
        Self {
            reporter,
            bus,
            runtime: tokio::runtime::Handle::current(),
            epoch: Instant::now(),
            state: Mutex::new(SandboxState {
                level,
                extra_rules: Vec::new(),
                rules_locked,
                executed: HashSet::new(),
                errors: HashMap::new(),
            }),
        }
    }

    /// The active security level.
    #[must_use]
    pub fn security_level(&self) -> SecurityLevel {
        self.state.lock().expect("sandbox lock poisoned").level
    }

    /// Time elapsed since the sandbox was initialized.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.epoch.elapsed()
    }

    /// Switches the security level. At the strictest level the rule set is
    /// sealed against further mutation; sealing is not undone by lowering
    /// the level later. Publishes a level-changed event.
    pub fn set_security_level(&self, level: SecurityLevel) {
        let previous = {
            let mut state = self.state.lock().expect("sandbox lock poisoned");
            let previous = state.level;
            state.level = level;
            if level == SecurityLevel::High {
                state.rules_locked = true;
            }
            previous
        };
        info!(from = %previous, to = %level, "Security level changed");
        self.bus.publish(
            topics::SECURITY_LEVEL_CHANGED,
            json!({ "from": previous.to_string(), "to": level.to_string() }),
        );
    }

    /// Switches the security level from untrusted string input. Unknown
    /// names are rejected without mutating any state.
    pub fn set_security_level_str(&self, level: &str) -> Result<SecurityLevel> {
        let parsed = SecurityLevel::from_str(level)?;
        self.set_security_level(parsed);
        Ok(parsed)
    }

    /// Adds a validation rule on top of the built-in set. Rejected once the
    /// rule set has been sealed by the strictest level.
    pub fn add_rule(&self, rule: ValidationRule) -> Result<()> {
        let mut state = self.state.lock().expect("sandbox lock poisoned");
        if state.rules_locked {
            return Err(RuntimeError::InvalidArgument(
                "rule set is sealed at the current security level".into(),
            ));
        }
        state.extra_rules.push(rule);
        Ok(())
    }

    // ================================================================
    // Static auditing
    // ================================================================

    /// Audits every hook source in a plugin descriptor against the active
    /// rule set. All findings are returned; whether they fail validation
    /// depends on the active level's threshold.
    pub fn validate_plugin_code(
        &self,
        plugin_id: &str,
        manifest: &PluginManifest,
    ) -> ValidationReport {
        let state = self.state.lock().expect("sandbox lock poisoned");
        let level = state.level;

        let mut violations = Vec::new();
        for (hook, source) in &manifest.hooks {
            let lowered = source.to_lowercase();
            for rule in BUILTIN_RULES.iter().chain(state.extra_rules.iter()) {
                for pattern in rule.patterns {
                    if lowered.contains(pattern) {
                        violations.push(Violation {
                            rule: rule.name.to_string(),
                            severity: rule.severity,
                            matched: Some(format!("{hook}: {pattern}")),
                        });
                    }
                }
            }
        }
        drop(state);

        let valid = !violations.iter().any(|v| level.fails_on(v.severity));
        if !violations.is_empty() {
            warn!(
                plugin_id = %plugin_id,
                findings = violations.len(),
                valid = valid,
                "Static audit found violations"
            );
        } else {
            debug!(plugin_id = %plugin_id, "Static audit clean");
        }
        ValidationReport { valid, violations }
    }

    // ================================================================
    // Supervised execution
    // ================================================================

    /// Runs plugin-supplied work racing the active level's deadline.
    ///
    /// On timeout the wrapper rejects but the spawned task is detached, not
    /// aborted; it may keep running and producing side effects. A failure
    /// from the work itself flows through the same logging pipeline with
    /// the original error preserved.
    pub async fn execute_sandboxed<F, T>(&self, plugin_id: &str, work: F) -> Result<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let deadline_ms = {
            let mut state = self.state.lock().expect("sandbox lock poisoned");
            state.executed.insert(plugin_id.to_string());
            state.level.execution_deadline_ms()
        };

        let task = self.runtime.spawn(work);
        match tokio::time::timeout(Duration::from_millis(deadline_ms), task).await {
            Err(_elapsed) => {
                let err = RuntimeError::Timeout {
                    plugin_id: plugin_id.to_string(),
                    timeout_ms: deadline_ms,
                };
                self.record_sandbox_error(plugin_id, "sandbox:execute", &err.to_string());
                Err(err)
            }
            Ok(Err(join_err)) => {
                let message = format!("sandboxed task aborted: {join_err}");
                self.record_sandbox_error(plugin_id, "sandbox:execute", &message);
                Err(RuntimeError::plugin_failure(
                    plugin_id,
                    "sandbox:execute",
                    anyhow::Error::msg(message),
                ))
            }
            Ok(Ok(Err(plugin_err))) => {
                self.record_sandbox_error(plugin_id, "sandbox:execute", &plugin_err.to_string());
                Err(RuntimeError::plugin_failure(
                    plugin_id,
                    "sandbox:execute",
                    plugin_err,
                ))
            }
            Ok(Ok(Ok(value))) => Ok(value),
        }
    }

    fn record_sandbox_error(&self, plugin_id: &str, operation: &str, message: &str) {
        let record =
            self.reporter
                .report_message(Some(plugin_id), operation, message, Value::Null);
        self.bus.publish(
            topics::SANDBOX_ERROR,
            json!({
                "plugin_id": plugin_id,
                "operation": operation,
                "message": message,
            }),
        );
        self.state
            .lock()
            .expect("sandbox lock poisoned")
            .errors
            .entry(plugin_id.to_string())
            .or_default()
            .push(record);
    }

    /// Errors recorded for one plugin's sandboxed executions.
    #[must_use]
    pub fn sandbox_errors(&self, plugin_id: &str) -> Vec<ErrorRecord> {
        self.state
            .lock()
            .expect("sandbox lock poisoned")
            .errors
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Aggregate sandbox health.
    #[must_use]
    pub fn stats(&self) -> SandboxStats {
        let state = self.state.lock().expect("sandbox lock poisoned");
        let mut offenders: Vec<OffenderStat> = state
            .errors
            .iter()
            .filter(|(_, errors)| !errors.is_empty())
            .map(|(plugin_id, errors)| OffenderStat {
                plugin_id: plugin_id.clone(),
                error_count: errors.len(),
            })
            .collect();
        offenders.sort_by(|a, b| b.error_count.cmp(&a.error_count).then(a.plugin_id.cmp(&b.plugin_id)));

        SandboxStats {
            sandboxed_plugins: state.executed.len(),
            plugins_with_errors: offenders.len(),
            total_errors: offenders.iter().map(|o| o.error_count).sum(),
            worst_offenders: offenders,
        }
    }

}

// ================================================================
// Surface write interception
// ================================================================

/// Properties whose writes can inject markup into the host surface.
const SENSITIVE_PROPS: &[&str] = &["html", "markup", "srcdoc"];

/// Content patterns that look executable when written into markup.
const RISKY_PATTERNS: &[&str] = &["<script", "javascript:", "onerror=", "onload="];

/// A mutable UI node owned by the chrome layer. The runtime only sees it
/// through `SandboxedSurface`.
#[derive(Debug, Default)]
pub struct SurfaceNode {
    properties: Mutex<HashMap<String, String>>,
}

impl SurfaceNode {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, property: &str) -> Option<String> {
        self.properties
            .lock()
            .expect("surface lock poisoned")
            .get(property)
            .cloned()
    }

    fn set_raw(&self, property: &str, value: &str) {
        self.properties
            .lock()
            .expect("surface lock poisoned")
            .insert(property.to_string(), value.to_string());
    }
}

/// Write-intercepting wrapper handed to plugin code instead of the node.
pub struct SandboxedSurface {
    sandbox: Arc<Sandbox>,
    node: Arc<SurfaceNode>,
    plugin_id: String,
}

impl SandboxedSurface {
    /// Wraps a surface node in the sandbox's write-interception policy,
    /// scoped to one plugin.
    #[must_use]
    pub fn new(sandbox: Arc<Sandbox>, node: Arc<SurfaceNode>, plugin_id: &str) -> Self {
        Self {
            sandbox,
            node,
            plugin_id: plugin_id.to_string(),
        }
    }

    /// Writes a property through the interception policy.
    ///
    /// Writes to markup-bearing properties are pattern-checked for
    /// executable-looking content. At the strictest level a match is
    /// blocked outright; at looser levels the write goes through but is
    /// audited.
    pub fn set(&self, property: &str, value: &str) -> Result<()> {
        if !SENSITIVE_PROPS.contains(&property) {
            self.node.set_raw(property, value);
            return Ok(());
        }

        let level = self.sandbox.security_level();
        let lowered = value.to_lowercase();
        let risky = RISKY_PATTERNS.iter().any(|p| lowered.contains(p));

        if risky && level == SecurityLevel::High {
            warn!(
                plugin_id = %self.plugin_id,
                property = %property,
                "Blocked executable-looking surface write"
            );
            self.sandbox.bus.publish(
                topics::SUSPICIOUS_OPERATION,
                json!({
                    "plugin_id": self.plugin_id,
                    "property": property,
                    "blocked": true,
                }),
            );
            return Err(RuntimeError::BlockedWrite {
                plugin_id: self.plugin_id.clone(),
                property: property.to_string(),
            });
        }

        self.sandbox.bus.publish(
            topics::SENSITIVE_ACCESS,
            json!({
                "plugin_id": self.plugin_id,
                "property": property,
            }),
        );
        if risky {
            self.sandbox.bus.publish(
                topics::SUSPICIOUS_OPERATION,
                json!({
                    "plugin_id": self.plugin_id,
                    "property": property,
                    "blocked": false,
                }),
            );
        }

        self.node.set_raw(property, value);
        Ok(())
    }

    /// Reads pass through unmodified.
    #[must_use]
    pub fn get(&self, property: &str) -> Option<String> {
        self.node.get(property)
    }
}
