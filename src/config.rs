//! Project-level settings stored at `.foreman/config.yaml`.
//!
//! The core only reads `worktree.setup`; the `onComplete` flags are
//! persisted here on behalf of embedding frontends.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::paths;

/// Project-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worktree: WorktreeConfig,
    #[serde(rename = "onComplete")]
    pub on_complete: OnCompleteConfig,
}

/// Worktree-related settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorktreeConfig {
    /// Shell command run inside a worktree right after it is created
    /// (dependency install, env file copy, and the like).
    pub setup: Option<String>,
}

/// Post-completion automation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OnCompleteConfig {
    pub push: bool,
    #[serde(rename = "createPR")]
    pub create_pr: bool,
}

impl Config {
    /// Read the config from `.foreman/config.yaml`.
    ///
    /// Returns defaults when the file doesn't exist.
    pub fn load(base_dir: &Path) -> Result<Config> {
        let path = paths::config_path(base_dir);
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Config::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()));
            }
        };

        serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Write the config to `.foreman/config.yaml`, creating the state
    /// directory if needed.
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let path = paths::config_path(base_dir);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let data = serde_yaml::to_string(self).context("failed to serialize config")?;
        std::fs::write(&path, data)
            .with_context(|| format!("failed to write {}", path.display()))
    }

    /// Check whether a config file exists for the project.
    pub fn exists(base_dir: &Path) -> bool {
        paths::config_path(base_dir).exists()
    }
}
