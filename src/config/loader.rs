//! Configuration loader

use std::path::Path;

use super::Config;
use crate::error::Result;

/// Load configuration from a YAML file
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = std::fs::read_to_string(path)?;
    load_config_from_str(&contents)
}

/// Load configuration from a YAML string (useful for testing)
pub fn load_config_from_str(yaml: &str) -> Result<Config> {
    let config: Config = serde_yaml::from_str(yaml)?;
    // Surface bad authenticator options at load time rather than on the
    // first connection attempt.
    config.search_settings()?;
    Ok(config)
}
