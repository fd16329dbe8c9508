//! Installed-plugin directory for Daybook.
//!
//! Owns the set of installed manifests and their active flags, and answers
//! the two queries the trust runtime needs: plugin metadata/liveness
//! (`PluginRegistry`) and declared-conflict lookup in both directions
//! (`ConflictLookup`).

use daybook_types::{
    ConflictInfo, ConflictLookup, ConflictRef, ManifestError, PluginInfo, PluginManifest,
    PluginRegistry,
};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("plugin already installed: {0}")]
    AlreadyInstalled(String),

    #[error("plugin not installed: {0}")]
    NotInstalled(String),

    #[error(transparent)]
    InvalidManifest(#[from] ManifestError),
}

struct InstalledPlugin {
    manifest: PluginManifest,
    active: bool,
}

/// In-memory directory of installed plugins.
#[derive(Default)]
pub struct PluginDirectory {
    plugins: RwLock<HashMap<String, InstalledPlugin>>,
}

impl PluginDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a manifest in the inactive state.
    pub fn install(&self, manifest: PluginManifest) -> Result<(), DirectoryError> {
        manifest.validate()?;
        let mut plugins = self.plugins.write().expect("directory lock poisoned");
        if plugins.contains_key(&manifest.id) {
            return Err(DirectoryError::AlreadyInstalled(manifest.id));
        }
        let id = manifest.id.clone();
        plugins.insert(
            id.clone(),
            InstalledPlugin {
                manifest,
                active: false,
            },
        );
        info!(plugin_id = %id, "Plugin installed");
        Ok(())
    }

    /// Removes a plugin entirely.
    pub fn uninstall(&self, id: &str) -> Result<PluginManifest, DirectoryError> {
        let mut plugins = self.plugins.write().expect("directory lock poisoned");
        let removed = plugins
            .remove(id)
            .ok_or_else(|| DirectoryError::NotInstalled(id.to_string()))?;
        info!(plugin_id = %id, "Plugin uninstalled");
        Ok(removed.manifest)
    }

    /// Flips a plugin's active flag.
    pub fn set_active(&self, id: &str, active: bool) -> Result<(), DirectoryError> {
        let mut plugins = self.plugins.write().expect("directory lock poisoned");
        let plugin = plugins
            .get_mut(id)
            .ok_or_else(|| DirectoryError::NotInstalled(id.to_string()))?;
        plugin.active = active;
        info!(plugin_id = %id, active = active, "Plugin active state changed");
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.plugins
            .read()
            .expect("directory lock poisoned")
            .contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.read().expect("directory lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Public metadata for every installed plugin.
    #[must_use]
    pub fn list(&self) -> Vec<PluginInfo> {
        let plugins = self.plugins.read().expect("directory lock poisoned");
        let mut infos: Vec<PluginInfo> = plugins
            .values()
            .map(|p| PluginInfo::from_manifest(&p.manifest, p.active))
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

impl PluginRegistry for PluginDirectory {
    fn manifest(&self, id: &str) -> Option<PluginManifest> {
        self.plugins
            .read()
            .expect("directory lock poisoned")
            .get(id)
            .map(|p| p.manifest.clone())
    }

    fn is_active(&self, id: &str) -> bool {
        self.plugins
            .read()
            .expect("directory lock poisoned")
            .get(id)
            .is_some_and(|p| p.active)
    }

    fn active_ids(&self) -> Vec<String> {
        let plugins = self.plugins.read().expect("directory lock poisoned");
        let mut ids: Vec<String> = plugins
            .values()
            .filter(|p| p.active)
            .map(|p| p.manifest.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

impl ConflictLookup for PluginDirectory {
    fn conflict_info(&self, id: &str) -> Option<ConflictInfo> {
        let plugins = self.plugins.read().expect("directory lock poisoned");
        let declared = plugins.get(id).map(|p| p.manifest.conflicts.clone());

        // Reversed entries carry the declaring plugin's id so callers can
        // name both parties without a second lookup.
        let reversed: Vec<ConflictRef> = plugins
            .values()
            .filter(|p| p.manifest.id != id)
            .flat_map(|p| {
                p.manifest
                    .conflicts
                    .iter()
                    .filter(|c| c.id() == id)
                    .map(|c| match c.reason() {
                        Some(reason) => ConflictRef::Annotated {
                            id: p.manifest.id.clone(),
                            reason: reason.to_string(),
                        },
                        None => ConflictRef::Id(p.manifest.id.clone()),
                    })
            })
            .collect();

        match declared {
            None if reversed.is_empty() => None,
            None => Some(ConflictInfo {
                declared: Vec::new(),
                reversed,
            }),
            Some(declared) => Some(ConflictInfo { declared, reversed }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daybook_types::DependencyRef;

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

    #[test]
    fn install_activate_query() {
        let dir = PluginDirectory::new();
        dir.install(manifest("a")).unwrap();
        assert!(dir.contains("a"));
        assert!(!dir.is_active("a"));

        dir.set_active("a", true).unwrap();
        assert!(dir.is_active("a"));
        assert_eq!(dir.active_ids(), vec!["a"]);

        let m = dir.manifest("a").unwrap();
        assert_eq!(m.id, "a");
    }

    #[test]
    fn duplicate_install_rejected() {
        let dir = PluginDirectory::new();
        dir.install(manifest("a")).unwrap();
        assert!(matches!(
            dir.install(manifest("a")),
            Err(DirectoryError::AlreadyInstalled(_))
        ));
    }

    #[test]
    fn uninstall_removes_plugin() {
        let dir = PluginDirectory::new();
        dir.install(manifest("a")).unwrap();
        dir.uninstall("a").unwrap();
        assert!(!dir.contains("a"));
        assert!(matches!(
            dir.uninstall("a"),
            Err(DirectoryError::NotInstalled(_))
        ));
    }

    #[test]
    fn invalid_manifest_rejected() {
        let dir = PluginDirectory::new();
        let mut bad = manifest("loop");
        bad.dependencies.push(DependencyRef::Id("loop".into()));
        assert!(matches!(
            dir.install(bad),
            Err(DirectoryError::InvalidManifest(_))
        ));
    }

    // ================================================================
    // Conflict index
    // ================================================================

    #[test]
    fn conflict_info_reports_declared_and_reversed() {
        let dir = PluginDirectory::new();
        let mut a = manifest("a");
        a.conflicts.push(ConflictRef::Annotated {
            id: "b".into(),
            reason: "duplicate sync".into(),
        });
        dir.install(a).unwrap();
        dir.install(manifest("b")).unwrap();

        let info_a = dir.conflict_info("a").unwrap();
        assert_eq!(info_a.declared.len(), 1);
        assert!(info_a.reversed.is_empty());

        // b declared nothing, but a declared against b.
        let info_b = dir.conflict_info("b").unwrap();
        assert!(info_b.declared.is_empty());
        assert_eq!(info_b.reversed.len(), 1);
        assert_eq!(info_b.reversed[0].id(), "a");
        assert_eq!(info_b.reversed[0].reason(), Some("duplicate sync"));
    }

    #[test]
    fn conflict_info_none_for_unknown_unreferenced_plugin() {
        let dir = PluginDirectory::new();
        dir.install(manifest("a")).unwrap();
        assert!(dir.conflict_info("ghost").is_none());
    }

    #[test]
    fn list_is_sorted_and_reflects_state() {
        let dir = PluginDirectory::new();
        dir.install(manifest("b")).unwrap();
        dir.install(manifest("a")).unwrap();
        dir.set_active("b", true).unwrap();

        let infos = dir.list();
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].id, "a");
        assert!(!infos[0].is_active);
        assert!(infos[1].is_active);
    }
}
