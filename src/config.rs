//! Optional TOML configuration with defaults for the CLI.

use log::warn;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Serial port of the logger, e.g. `/dev/ttyUSB0`.
    pub port: Option<String>,
    /// Fixed port speed; when unset the probe picks the fastest working one.
    pub speed: Option<u32>,
    /// Keep decoding past record checksum mismatches.
    pub lenient: bool,
}

pub async fn parse_config<P>(path: P) -> Result<Config, ConfigError>
where
    P: AsRef<std::path::Path>,
{
    if let Ok(text) = tokio::fs::read_to_string(&path).await {
        Ok(toml::from_str(&text)?)
    } else {
        warn!("unable to read config file, using defaults");
        Ok(Config::default())
    }
}
