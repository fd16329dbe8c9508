//! Plugin manifests and the declarations that drive access decisions.
//!
//! A manifest is authored by the plugin developer and installed into the
//! registry. Two declaration lists matter to the trust model:
//! - `dependencies` — plugins this one relies on; acts as a permission grant
//!   toward the named plugin.
//! - `conflicts` — plugins this one must never interoperate with; enforced
//!   in both directions.
//!
//! Both lists accept a bare plugin id or an annotated form, resolved into a
//! tagged variant once at the manifest boundary rather than re-inspected at
//! every check site.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dependency declaration: either a bare plugin id or an annotated entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependencyRef {
    /// `"com.daybook.agenda"`
    Id(String),
    /// `{ "id": "com.daybook.agenda", "version": ">=1.2" }`
    Annotated {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
}

impl DependencyRef {
    /// The referenced plugin id, regardless of form.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Annotated { id, .. } => id,
        }
    }
}

/// A conflict declaration: either a bare plugin id or an id with a reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConflictRef {
    /// `"com.example.legacy-sync"`
    Id(String),
    /// `{ "id": "com.example.legacy-sync", "reason": "duplicate event writes" }`
    Annotated { id: String, reason: String },
}

impl ConflictRef {
    /// The referenced plugin id, regardless of form.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Annotated { id, .. } => id,
        }
    }

    /// The declared reason, if the annotated form was used.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Annotated { reason, .. } => Some(reason),
        }
    }
}

/// Conflict declarations touching one plugin, from both directions.
///
/// `declared` holds the plugin's own conflict list. `reversed` holds one
/// entry per *other* plugin whose conflict list names this plugin; the entry
/// id is the declaring plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictInfo {
    pub declared: Vec<ConflictRef>,
    pub reversed: Vec<ConflictRef>,
}

impl ConflictInfo {
    /// Returns the conflict entry involving `other`, if any, searching both
    /// directions.
    #[must_use]
    pub fn involving(&self, other: &str) -> Option<&ConflictRef> {
        self.declared
            .iter()
            .find(|c| c.id() == other)
            .or_else(|| self.reversed.iter().find(|c| c.id() == other))
    }
}

/// Validation errors for plugin manifests.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("plugin id must not be empty")]
    EmptyId,

    #[error("plugin '{0}' must declare a name")]
    EmptyName(String),

    #[error("plugin '{0}' must declare a version")]
    EmptyVersion(String),

    #[error("plugin '{0}' declares a dependency on itself")]
    SelfDependency(String),
}

/// A plugin's installable description.
///
/// `hooks` maps hook names (e.g. `on_load`, `on_event`) to the plugin's
/// script source for that hook. Hook sources are what the sandbox audits
/// before activation and executes under supervision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,
    #[serde(default)]
    pub conflicts: Vec<ConflictRef>,
    #[serde(default)]
    pub hooks: BTreeMap<String, String>,
}

impl PluginManifest {
    /// Checks the structural invariants a manifest must satisfy before it
    /// can be installed.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.id.is_empty() {
            return Err(ManifestError::EmptyId);
        }
        if self.name.is_empty() {
            return Err(ManifestError::EmptyName(self.id.clone()));
        }
        if self.version.is_empty() {
            return Err(ManifestError::EmptyVersion(self.id.clone()));
        }
        if self.dependencies.iter().any(|d| d.id() == self.id) {
            return Err(ManifestError::SelfDependency(self.id.clone()));
        }
        Ok(())
    }

    /// Whether this manifest declares `other` as a dependency.
    #[must_use]
    pub fn depends_on(&self, other: &str) -> bool {
        self.dependencies.iter().any(|d| d.id() == other)
    }

    /// Whether this manifest declares a conflict with `other`.
    #[must_use]
    pub fn conflicts_with(&self, other: &str) -> bool {
        self.conflicts.iter().any(|c| c.id() == other)
    }
}

/// The read-only metadata view exposed to extension code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub is_active: bool,
}

impl PluginInfo {
    /// Builds the public view from a manifest and its current active state.
    #[must_use]
    pub fn from_manifest(manifest: &PluginManifest, is_active: bool) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: manifest.version.clone(),
            author: manifest.author.clone(),
            description: manifest.description.clone(),
            is_active,
        }
    }
}
