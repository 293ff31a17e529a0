//! Configuration for the runtime substrate

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::RuntimeError;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub boot: BootConfig,
    pub faults: FaultConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default log filter, overridable via `RUST_LOG`
    pub log_filter: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_filter: "info".into(),
        }
    }
}

/// Boot settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BootConfig {
    /// Pre-extracted flat image to load into the image region
    pub image_path: Option<PathBuf>,
}

/// Fault handling settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultConfig {
    /// Install the platform fault handlers at boot
    pub install_handlers: bool,
    /// Number of stack slots the crash reporter dumps
    pub stack_dump_depth: usize,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self {
            install_handlers: true,
            stack_dump_depth: 48,
        }
    }
}

impl Config {
    /// Default config file location under the platform config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("oxidized-xenon").join("config.toml"))
    }

    /// Load from a specific path
    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    /// Load from the given path, or the default location, falling back to
    /// defaults if no file exists.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, RuntimeError> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path(),
        };

        match candidate {
            Some(p) if p.exists() => Self::load(&p),
            _ => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.general.log_filter, "info");
        assert!(config.faults.install_handlers);
        assert_eq!(config.faults.stack_dump_depth, 48);
        assert!(config.boot.image_path.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [faults]
            stack_dump_depth = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.faults.stack_dump_depth, 16);
        assert!(config.faults.install_handlers);
        assert_eq!(config.general.log_filter, "info");
    }
}
