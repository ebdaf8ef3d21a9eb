//! Configuration loader with tier-based merging.

use super::merge::deep_merge_all;
use super::types::Config;
use anyhow::{Context, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Name of the configuration file inside each tier directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Configuration tier priority (lowest to highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Defaults = 0,
    Project = 1,
    User = 2,
    Environment = 3,
    /// An explicit file that bypasses the other tiers.
    Explicit = 4,
}

impl std::fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigTier::Defaults => write!(f, "defaults"),
            ConfigTier::Project => write!(f, "project"),
            ConfigTier::User => write!(f, "user"),
            ConfigTier::Environment => write!(f, "environment"),
            ConfigTier::Explicit => write!(f, "explicit"),
        }
    }
}

/// Directories for the file-backed tiers.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Project tier (`$CWD/tasksync` or `TASKSYNC_PROJECT_DIR`).
    pub project_dir: Option<PathBuf>,
    /// User tier (`~/.tasksync` or `TASKSYNC_USER_DIR`).
    pub user_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Discover tier directories from the environment and the home directory.
    pub fn discover() -> Self {
        let project_dir = std::env::var("TASKSYNC_PROJECT_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| Some(PathBuf::from("tasksync")));

        let user_dir = std::env::var("TASKSYNC_USER_DIR")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".tasksync")));

        Self {
            project_dir,
            user_dir,
        }
    }

    pub fn with_dirs(project_dir: Option<PathBuf>, user_dir: Option<PathBuf>) -> Self {
        Self {
            project_dir,
            user_dir,
        }
    }

    /// Existing tier directories, for the watcher.
    pub fn existing_dirs(&self) -> Vec<PathBuf> {
        [self.project_dir.as_ref(), self.user_dir.as_ref()]
            .into_iter()
            .flatten()
            .filter(|dir| dir.is_dir())
            .cloned()
            .collect()
    }
}

/// Loads and merges configuration.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub paths: ConfigPaths,
    config: Config,
    /// Files that contributed, with their tier.
    sources: Vec<(ConfigTier, PathBuf)>,
}

impl ConfigLoader {
    /// Load from all tiers. `TASKSYNC_CONFIG_PATH` selects an explicit file.
    pub fn load() -> Result<Self> {
        match std::env::var("TASKSYNC_CONFIG_PATH") {
            Ok(explicit) => Self::load_file(ConfigPaths::discover(), PathBuf::from(explicit)),
            Err(_) => Self::load_with_paths(ConfigPaths::discover()),
        }
    }

    /// Load a single explicit file, then apply environment overrides.
    pub fn load_file(paths: ConfigPaths, path: PathBuf) -> Result<Self> {
        let mut config = Config::load(&path)
            .with_context(|| format!("failed to load config file {}", path.display()))?;
        apply_overrides(&mut config, |key| std::env::var(key).ok());
        Ok(Self {
            paths,
            config,
            sources: vec![(ConfigTier::Explicit, path)],
        })
    }

    /// Load defaults, project tier, user tier and environment, in that order.
    pub fn load_with_paths(paths: ConfigPaths) -> Result<Self> {
        Self::load_with_env(paths, |key| std::env::var(key).ok())
    }

    /// Like [`ConfigLoader::load_with_paths`] with an injected environment.
    pub fn load_with_env<F>(paths: ConfigPaths, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut tiers: Vec<Value> = vec![serde_json::to_value(Config::default())?];
        let mut sources = Vec::new();

        for (tier, dir) in [
            (ConfigTier::Project, paths.project_dir.as_deref()),
            (ConfigTier::User, paths.user_dir.as_deref()),
        ] {
            let Some(dir) = dir else { continue };
            let file = dir.join(CONFIG_FILE);
            if let Some(value) = read_tier(&file, tier) {
                tiers.push(value);
                sources.push((tier, file));
            }
        }

        let merged = deep_merge_all(tiers);
        let mut config: Config =
            serde_json::from_value(merged).context("invalid merged configuration")?;

        if apply_overrides(&mut config, env) {
            sources.push((ConfigTier::Environment, PathBuf::new()));
        }

        Ok(Self {
            paths,
            config,
            sources,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn sources(&self) -> &[(ConfigTier, PathBuf)] {
        &self.sources
    }

    /// The explicit file, if one was used.
    pub fn explicit_path(&self) -> Option<&Path> {
        self.sources
            .iter()
            .find(|(tier, _)| *tier == ConfigTier::Explicit)
            .map(|(_, path)| path.as_path())
    }

    /// Reload from the same source (explicit file or tiers).
    pub fn reload(&self) -> Result<Self> {
        match self.explicit_path() {
            Some(path) => Self::load_file(self.paths.clone(), path.to_path_buf()),
            None => Self::load_with_paths(self.paths.clone()),
        }
    }
}

/// Read one tier file. Missing files are skipped silently, broken ones with a warning.
fn read_tier(file: &Path, tier: ConfigTier) -> Option<Value> {
    if !file.exists() {
        return None;
    }
    let content = match std::fs::read_to_string(file) {
        Ok(content) => content,
        Err(e) => {
            warn!("Skipping {} config {}: {}", tier, file.display(), e);
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Skipping {} config {}: {}", tier, file.display(), e);
            None
        }
    }
}

/// Apply `TASKSYNC_*` overrides. Returns whether any applied.
fn apply_overrides<F>(config: &mut Config, env: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = false;

    if let Some(base) = env("TASKSYNC_API_BASE") {
        config.api.base_url = base;
        applied = true;
    }

    if let Some(token) = env("TASKSYNC_API_TOKEN") {
        config.api.token = Some(token);
        applied = true;
    }

    if let Some(raw) = env("TASKSYNC_USER_ID") {
        match raw.trim().parse() {
            Ok(id) => {
                config.session.user_id = Some(id);
                applied = true;
            }
            Err(_) => warn!("Ignoring TASKSYNC_USER_ID={}: not an integer", raw),
        }
    }

    if let Some(raw) = env("TASKSYNC_PROJECT") {
        match raw.trim().parse() {
            Ok(id) => {
                config.session.selected_project = Some(id);
                applied = true;
            }
            Err(_) => warn!("Ignoring TASKSYNC_PROJECT={}: not an integer", raw),
        }
    }

    applied
}
