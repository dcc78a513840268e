//! Configuration bootstrap

use std::path::Path;

use tracing::info;

use crate::{Config, Error, Result};

/// Load configuration from a config file or environment variables
///
/// Config file search order:
/// 1. explicit path (command line)
/// 2. `DEBATE_CONFIG_PATH` environment variable
/// 3. ./config.yaml (current working directory)
/// 4. /config/config.yaml (container mount path)
/// 5. environment variables only
///
/// Logging is not initialised yet when this runs, so progress goes to stderr.
pub fn load_config(explicit: Option<&str>) -> Result<Config> {
    let config_path = explicit
        .map(str::to_string)
        .or_else(|| std::env::var("DEBATE_CONFIG_PATH").ok())
        .filter(|p| Path::new(p).exists())
        .or_else(|| {
            ["config.yaml", "/config/config.yaml"]
                .into_iter()
                .find(|p| Path::new(p).exists())
                .map(str::to_string)
        });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::from_file(&path)?
        }
        None => {
            eprintln!("No config file found, using environment variables");
            Config::from_env()?
        }
    };

    config.validate().map_err(Error::InvalidConfig)?;

    info!("Configuration loaded and validated successfully");
    Ok(config)
}
