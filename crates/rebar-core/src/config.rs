//! Configuration management for Rebar.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Rebar configuration loaded from .git/rebar/config.toml.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Rebase settings.
    #[serde(default)]
    pub rebase: RebaseConfig,
}

impl Config {
    /// Load config from a TOML file.
    ///
    /// # Errors
    /// Returns error if file can't be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save config to a TOML file.
    ///
    /// # Errors
    /// Returns error if serialization or write fails.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| std::io::Error::other(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }
}

/// Settings for `rebar rebase`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct RebaseConfig {
    /// Persist progress once at the end instead of after every commit.
    #[serde(default)]
    pub single_transaction: bool,

    /// Merge in memory first and only touch the working copy on conflict.
    #[serde(default)]
    pub in_memory: bool,

    /// Rewrite obsolete revisions even if that creates divergent successors.
    #[serde(default)]
    pub allow_divergence: bool,

    /// Skip obsolete revisions whose successors are already present.
    #[serde(default = "default_true")]
    pub skip_obsolete: bool,

    /// Keep revisions whose changes are already in the destination.
    #[serde(default)]
    pub allow_empty_commits: bool,

    /// Record the original revision id in the rewritten revision's extra.
    #[serde(default)]
    pub store_source: bool,
}

impl Default for RebaseConfig {
    fn default() -> Self {
        Self {
            single_transaction: false,
            in_memory: false,
            allow_divergence: false,
            skip_obsolete: true,
            allow_empty_commits: false,
            store_source: false,
        }
    }
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.rebase.skip_obsolete);
        assert!(!config.rebase.single_transaction);
        assert!(!config.rebase.in_memory);
    }

    #[test]
    fn test_config_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        let config = Config {
            rebase: RebaseConfig {
                single_transaction: true,
                in_memory: true,
                store_source: true,
                ..RebaseConfig::default()
            },
        };

        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.rebase, config.rebase);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str("[rebase]\nallow_divergence = true\n").unwrap();
        assert!(config.rebase.allow_divergence);
        assert!(config.rebase.skip_obsolete);
    }

    #[test]
    fn test_missing_config_returns_default() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config.rebase, RebaseConfig::default());
    }
}
