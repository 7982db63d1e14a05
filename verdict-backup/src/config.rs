//! Configuration management for the backup engine.
//!
//! Loads engine settings from an optional TOML file. Every field has a
//! default, so a partial file (or no file at all) is valid.

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Location of the target registry (JSON)
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Mirroring tool binary
    #[serde(default = "default_mirror")]
    pub mirror: String,

    /// Checksum tool binary (prints `<hex> <path>`)
    #[serde(default = "default_checksum")]
    pub checksum: String,

    /// Checksum algorithm the mirror tool embeds in its item lines.
    /// Must produce the same digest as `checksum`.
    #[serde(default = "default_checksum_choice")]
    pub checksum_choice: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Name of the control directory created at each destination
    #[serde(default = "default_control_dir")]
    pub dir_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_registry_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".verdict-backup.json")
}

fn default_mirror() -> String {
    "rsync".to_string()
}

fn default_checksum() -> String {
    "md5sum".to_string()
}

fn default_checksum_choice() -> String {
    "md5".to_string()
}

fn default_control_dir() -> String {
    ".verdict".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
        }
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            mirror: default_mirror(),
            checksum: default_checksum(),
            checksum_choice: default_checksum_choice(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            dir_name: default_control_dir(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            tools: ToolsConfig::default(),
            control: ControlConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Default configuration with the registry at `path`.
    pub fn with_registry(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.registry.path = path.into();
        config
    }
}
