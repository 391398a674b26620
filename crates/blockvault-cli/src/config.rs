//! CLI defaults, loaded from a TOML file and overridable per invocation.
//!
//! Resolution order: built-in defaults, then
//! `~/.config/blockvault/config.toml` (or the file named by
//! `BLOCKVAULT_CONFIG`), then environment variables, then command-line
//! flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store root used when a command does not name one.
    pub store_root: Option<PathBuf>,
    /// Block limit used by `init` when `--limit-blocks` is not given.
    pub limit_blocks: Option<u64>,
    /// Retries for device-mapper removals.
    pub dm_remove_retries: Option<u32>,
    /// Backoff between removal retries, in milliseconds.
    pub dm_remove_backoff_ms: Option<u64>,
}

impl Config {
    pub fn load() -> Result<Config> {
        let path = match std::env::var_os("BLOCKVAULT_CONFIG") {
            Some(path) => PathBuf::from(path),
            None => match dirs::config_dir() {
                Some(dir) => dir.join("blockvault").join("config.toml"),
                None => return Ok(Config::default()),
            },
        };
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        debug!(path = %path.display(), "loading config");
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Some(root) = std::env::var_os("BLOCKVAULT_STORE_ROOT") {
            self.store_root = Some(PathBuf::from(root));
        }
        if let Ok(limit) = std::env::var("BLOCKVAULT_LIMIT_BLOCKS") {
            if let Ok(limit) = limit.parse() {
                self.limit_blocks = Some(limit);
            }
        }
    }
}
