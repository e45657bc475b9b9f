//! Subcommand implementations

pub mod backtest;
pub mod paper;

use anyhow::{Context, Result};
use tracing::info;

use tradesim::Config;

/// Load the config file, or defaults plus environment overrides
pub fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let config = Config::from_file(path)
                .context(format!("Failed to load config from {}", path))?;
            info!("Loaded configuration from: {}", path);
            Ok(config)
        }
        None => {
            let mut config = Config::default();
            config.apply_env_overrides()?;
            config.validate().context("Invalid configuration")?;
            info!("Using default configuration");
            Ok(config)
        }
    }
}
