// src/config.rs
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use lapin::ExchangeKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CONFIG_FILE_NAME: &str = "rabbit_fixtures.json";

/// Every logical connection a test run declares up front, keyed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RabbitConfig {
    pub connections: BTreeMap<String, ConnectionConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Port of the management HTTP API on the same host.
    #[serde(default = "default_management_port")]
    pub management_port: u16,
    /// Exchange name to the single queue bound to it.
    #[serde(alias = "config")]
    pub exchanges: BTreeMap<String, ExchangeConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub queue: String,
    #[serde(rename = "type")]
    pub exchange_type: ExchangeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl ExchangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Topic => "topic",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeType> for ExchangeKind {
    fn from(kind: ExchangeType) -> Self {
        match kind {
            ExchangeType::Direct => ExchangeKind::Direct,
            ExchangeType::Topic => ExchangeKind::Topic,
            ExchangeType::Fanout => ExchangeKind::Fanout,
            ExchangeType::Headers => ExchangeKind::Headers,
        }
    }
}

fn default_management_port() -> u16 { 15672 }

impl RabbitConfig {
    /// Rejects configurations the broker would refuse or that could never be provisioned.
    pub fn validate(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(anyhow!("Configuration error: no connections configured"));
        }

        for (name, connection) in &self.connections {
            if name.trim().is_empty() {
                return Err(anyhow!("Configuration error: connection names cannot be empty"));
            }
            connection
                .validate()
                .with_context(|| format!("Invalid connection '{}'", name))?;
        }

        Ok(())
    }
}

impl ConnectionConfig {
    fn validate(&self) -> Result<()> {
        let required = [
            ("host", &self.host),
            ("username", &self.username),
            ("vhost", &self.vhost),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(anyhow!("{} cannot be empty", field));
            }
        }

        if self.port == 0 || self.management_port == 0 {
            return Err(anyhow!("ports must be non-zero"));
        }

        for (exchange, exchange_config) in &self.exchanges {
            if exchange.is_empty() {
                return Err(anyhow!("exchange names cannot be empty"));
            }
            // The broker refuses declarations in the reserved namespace.
            if exchange.starts_with("amq.") {
                return Err(anyhow!("exchange '{}' uses the reserved amq. prefix", exchange));
            }
            if exchange_config.queue.is_empty() {
                return Err(anyhow!("exchange '{}' has an empty queue name", exchange));
            }
        }

        Ok(())
    }
}

pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", PathBuf::from(CONFIG_FILE_NAME)),
        ("Current directory (alternative)", Path::new("config").join(CONFIG_FILE_NAME)),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(format!(".{}", CONFIG_FILE_NAME));
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find {} configuration file. \
         Create one in the current directory, ./config or your home directory \
         (or run `rabbit-fixtures init`).",
        CONFIG_FILE_NAME
    ))
}

pub fn load_config() -> Result<RabbitConfig> {
    let config_path = find_config_file()?;
    load_config_from(&config_path)
}

pub fn load_config_from(config_path: &Path) -> Result<RabbitConfig> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;

    let config = parse_config(&config_content)?;
    debug!(
        path = %config_path.display(),
        connections = config.connections.len(),
        "Loaded configuration"
    );
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<RabbitConfig> {
    let config: RabbitConfig = serde_json::from_str(content)
        .context("Configuration file contains invalid JSON or missing required fields")?;
    config.validate()?;
    Ok(config)
}

pub fn default_config() -> RabbitConfig {
    let mut exchanges = BTreeMap::new();
    exchanges.insert(
        "test.events".to_string(),
        ExchangeConfig {
            queue: "test.events.queue".to_string(),
            exchange_type: ExchangeType::Fanout,
        },
    );

    let mut connections = BTreeMap::new();
    connections.insert(
        "default".to_string(),
        ConnectionConfig {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "fixtures".to_string(),
            management_port: default_management_port(),
            exchanges,
        },
    );

    RabbitConfig { connections }
}

pub fn create_default_config_file(path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(&default_config())
        .context("Failed to serialize default configuration")?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory at {}", parent.display()))?;
        }
    }

    fs::write(path, json)
        .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

    info!("Created default configuration file at: {}", path.display());
    Ok(())
}
