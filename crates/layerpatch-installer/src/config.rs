use std::fs;
use std::io;
use std::path::{Component, Path};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::PatchError;
use crate::layout::InstallationLayout;

/// Engine settings read from `.layerpatch/patching.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatchToolConfig {
    pub lock: LockConfig,
    pub rollback: RollbackConfig,
    pub configuration: ConfigurationDirs,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Block until the installation lock is free instead of failing fast.
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RollbackConfig {
    pub restore_configuration: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            restore_configuration: true,
        }
    }
}

/// Directories (relative to the installation root) backed up in full by every
/// apply and restored in full by rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigurationDirs {
    pub directories: Vec<String>,
}

impl Default for ConfigurationDirs {
    fn default() -> Self {
        Self {
            directories: vec![
                "standalone/configuration".to_string(),
                "domain/configuration".to_string(),
                "appclient/configuration".to_string(),
            ],
        }
    }
}

impl PatchToolConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse patching config")?;
        for dir in &config.configuration.directories {
            validate_relative_dir(dir)?;
        }
        Ok(config)
    }

    /// Loads the installation's config, falling back to defaults when absent.
    pub fn load(layout: &InstallationLayout) -> Result<Self, PatchError> {
        let path = layout.config_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => {
                return Err(PatchError::InvalidState(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        Self::from_toml_str(&raw)
            .map_err(|err| PatchError::InvalidState(format!("{}: {err:#}", path.display())))
    }
}

fn validate_relative_dir(dir: &str) -> Result<()> {
    let path = Path::new(dir);
    if dir.trim().is_empty()
        || !path
            .components()
            .all(|component| matches!(component, Component::Normal(_)))
    {
        return Err(anyhow!(
            "configuration directory must be a relative path without '..': {dir}"
        ));
    }
    Ok(())
}
