use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenv::dotenv;

pub const CONFIG_PATH_VAR: &str = "RABBIT_FIXTURES_CONFIG";
pub const CONNECT_TIMEOUT_VAR: &str = "RABBIT_FIXTURES_CONNECT_TIMEOUT_SECONDS";

/// Process-level overrides read from the environment (and `.env`, if present).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    /// `None` leaves connection attempts to the transport's own behaviour.
    pub connect_timeout_seconds: Option<u64>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = lookup(CONFIG_PATH_VAR)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from);

        let connect_timeout_seconds = match lookup(CONNECT_TIMEOUT_VAR) {
            Some(value) => Some(
                value
                    .parse()
                    .with_context(|| format!("{} must be a number of seconds", CONNECT_TIMEOUT_VAR))?,
            ),
            None => None,
        };

        Ok(Settings { config_path, connect_timeout_seconds })
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_seconds.map(Duration::from_secs)
    }
}
