//! Configuration file parsing and merging
//!
//! This module handles parsing of `delink.toml` and `delink.local.toml` files.
//! Tables are merged recursively, everything else in the local file replaces
//! the base value.

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::{Error, Result};

/// Root walked when neither the config nor the command line name one
pub const DEFAULT_ROOT: &str = "install";

/// Base configuration file name
pub const CONFIG_FILE: &str = "delink.toml";

/// Local override file name, usually kept out of version control
pub const LOCAL_CONFIG_FILE: &str = "delink.local.toml";

/// Main configuration structure for delink
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Materialization settings
    pub materialize: MaterializeConfig,
}

/// Materialization configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaterializeConfig {
    /// Directory tree to walk (default: "install")
    pub root: Utf8PathBuf,

    /// Where per-link staging directories are created (default: system temp dir)
    pub staging_dir: Option<Utf8PathBuf>,
}

impl Default for MaterializeConfig {
    fn default() -> Self {
        Self {
            root: Utf8PathBuf::from(DEFAULT_ROOT),
            staging_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a workspace directory.
    ///
    /// This loads `delink.toml` and merges `delink.local.toml` on top if it exists.
    pub fn load(workspace_root: &Utf8Path) -> Result<Self> {
        let config_path = workspace_root.join(CONFIG_FILE);
        let local_config_path = workspace_root.join(LOCAL_CONFIG_FILE);

        let base_config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<toml::Value>(&content)?
        } else {
            toml::Value::Table(toml::map::Map::new())
        };

        let merged = if local_config_path.exists() {
            let content = std::fs::read_to_string(&local_config_path)?;
            merge_toml_values(base_config, toml::from_str::<toml::Value>(&content)?)
        } else {
            base_config
        };

        let config: Config = merged.try_into()?;
        config.validate()?;
        tracing::debug!(workspace = %workspace_root, ?config, "Loaded configuration");
        Ok(config)
    }

    /// Load configuration from a string (for testing)
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the walk meaningless
    fn validate(&self) -> Result<()> {
        if self.materialize.root.as_str().trim().is_empty() {
            return Err(Error::config(
                "materialize.root is empty",
                "Set materialize.root to the deploy tree, for example \"install\"",
            ));
        }
        if let Some(dir) = &self.materialize.staging_dir
            && dir.as_str().trim().is_empty()
        {
            return Err(Error::config(
                "materialize.staging_dir is empty",
                "Remove materialize.staging_dir to use the system temp directory",
            ));
        }
        Ok(())
    }

    /// Resolve the root against the workspace, letting `override_root` win
    pub fn resolve_root(
        &self,
        workspace_root: &Utf8Path,
        override_root: Option<&Utf8Path>,
    ) -> Utf8PathBuf {
        let root = override_root.unwrap_or(&self.materialize.root);
        if root.is_absolute() {
            root.to_owned()
        } else {
            workspace_root.join(root)
        }
    }

    /// Resolve the staging directory against the workspace
    pub fn resolve_staging_dir(&self, workspace_root: &Utf8Path) -> Option<Utf8PathBuf> {
        self.materialize.staging_dir.as_ref().map(|dir| {
            if dir.is_absolute() {
                dir.clone()
            } else {
                workspace_root.join(dir)
            }
        })
    }
}

/// Merge two TOML values:
/// - Tables: recursively merged
/// - Arrays: local replaces base (not merged)
/// - Primitives: local overrides base
fn merge_toml_values(base: toml::Value, local: toml::Value) -> toml::Value {
    match (base, local) {
        (toml::Value::Table(mut base_table), toml::Value::Table(local_table)) => {
            for (key, local_value) in local_table {
                if let Some(base_value) = base_table.remove(&key) {
                    base_table.insert(key, merge_toml_values(base_value, local_value));
                } else {
                    base_table.insert(key, local_value);
                }
            }
            toml::Value::Table(base_table)
        }
        (_, local) => local,
    }
}
