//! Runtime configuration — reads `~/.daybook/runtime.toml` and tunes the
//! security level and retention caps.
//!
//! A missing file means defaults; a malformed file means defaults with a
//! warning. Configuration can degrade, never fail.

use crate::sandbox::SecurityLevel;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

/// Tunables consumed by the runtime components.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeConfig {
    pub security_level: SecurityLevel,
    /// Cap for per-caller access logs and the global error log.
    pub max_log_size: usize,
    /// Cap for per-plugin communication histories.
    pub max_history_size: usize,
    /// Default message cap for newly created channels.
    pub max_channel_messages: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            security_level: SecurityLevel::Normal,
            max_log_size: 100,
            max_history_size: 50,
            max_channel_messages: 100,
        }
    }
}

impl RuntimeConfig {
    /// Loads config from `~/.daybook/runtime.toml` if it exists.
    pub fn load() -> Self {
        Self::load_from(dirs_path().join("runtime.toml"))
    }

    /// Loads config from an explicit path. Missing, unreadable, or
    /// malformed files fall back to defaults.
    pub fn load_from(config_path: PathBuf) -> Self {
        if !config_path.exists() {
            info!("No runtime config at {:?}, using defaults", config_path);
            return Self::default();
        }

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
                Ok(file) => {
                    info!("Loaded runtime config from {:?}", config_path);
                    file.into_config()
                }
                Err(e) => {
                    warn!(
                        "Failed to parse runtime config {:?}: {}. Using defaults.",
                        config_path, e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!("Failed to read runtime config {:?}: {}", config_path, e);
                Self::default()
            }
        }
    }
}

/// Raw TOML structure matching the runtime.toml format.
#[derive(Deserialize)]
struct ConfigFile {
    #[serde(default)]
    runtime: RuntimeSection,
}

#[derive(Deserialize, Default)]
struct RuntimeSection {
    #[serde(default, rename = "security-level")]
    security_level: Option<String>,
    #[serde(default, rename = "max-log-size")]
    max_log_size: Option<usize>,
    #[serde(default, rename = "max-history-size")]
    max_history_size: Option<usize>,
    #[serde(default, rename = "max-channel-messages")]
    max_channel_messages: Option<usize>,
}

impl ConfigFile {
    fn into_config(self) -> RuntimeConfig {
        let defaults = RuntimeConfig::default();
        let security_level = match self.runtime.security_level.as_deref() {
            None => defaults.security_level,
            Some(raw) => match SecurityLevel::from_str(raw) {
                Ok(level) => level,
                Err(e) => {
                    warn!("{e}; keeping default security level");
                    defaults.security_level
                }
            },
        };
        RuntimeConfig {
            security_level,
            max_log_size: self.runtime.max_log_size.unwrap_or(defaults.max_log_size),
            max_history_size: self
                .runtime
                .max_history_size
                .unwrap_or(defaults.max_history_size),
            max_channel_messages: self
                .runtime
                .max_channel_messages
                .unwrap_or(defaults.max_channel_messages),
        }
    }
}

/// Resolve the Daybook config directory.
fn dirs_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        Path::new(&home).join(".daybook")
    } else if let Ok(home) = std::env::var("USERPROFILE") {
        Path::new(&home).join(".daybook")
    } else {
        PathBuf::from(".daybook")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: write TOML content to a temp file and load it.
    fn load_config_from_str(toml_content: &str) -> RuntimeConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.toml");
        std::fs::write(&path, toml_content).unwrap();
        RuntimeConfig::load_from(path)
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load_from(dir.path().join("nonexistent.toml"));
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn full_config_parses() {
        let config = load_config_from_str(
            r#"
[runtime]
security-level = "high"
max-log-size = 200
max-history-size = 75
max-channel-messages = 32
"#,
        );
        assert_eq!(config.security_level, SecurityLevel::High);
        assert_eq!(config.max_log_size, 200);
        assert_eq!(config.max_history_size, 75);
        assert_eq!(config.max_channel_messages, 32);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config = load_config_from_str(
            r#"
[runtime]
security-level = "low"
"#,
        );
        assert_eq!(config.security_level, SecurityLevel::Low);
        assert_eq!(config.max_log_size, RuntimeConfig::default().max_log_size);
    }

    #[test]
    fn unknown_security_level_keeps_default() {
        let config = load_config_from_str(
            r#"
[runtime]
security-level = "paranoid"
"#,
        );
        assert_eq!(config.security_level, SecurityLevel::Normal);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let config = load_config_from_str("this is not valid toml {{{{");
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn empty_runtime_section_is_all_defaults() {
        let config = load_config_from_str("[runtime]\n");
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn unreadable_path_falls_back_to_defaults() {
        // Point at a directory instead of a file — read_to_string fails.
        let dir = tempfile::tempdir().unwrap();
        let config = RuntimeConfig::load_from(dir.path().to_path_buf());
        assert_eq!(config, RuntimeConfig::default());
    }
}
