// Configuration loader
// Loads settings from ~/.agent-core/config.toml, falling back to defaults

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::constants::{CONFIG_DIR, CONFIG_FILE};
use super::settings::Config;

/// Default config file location
pub fn config_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
}

/// Load configuration from the user's config file, or defaults if it does not exist
pub fn load_config() -> Result<Config> {
    let path = config_path()?;
    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    load_config_from(&path)
}

/// Load and validate configuration from an explicit path
pub fn load_config_from(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path.display()))?;

    debug!("Loaded config from {}", path.display());
    Ok(config)
}
