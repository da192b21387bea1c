//! RabbitMQ management HTTP API: virtual host and permission provisioning.

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Serialize;
use tracing::{debug, info};

use super::errors::{RabbitMQError, Result};
use crate::config::ConnectionConfig;

/// Ensures a connection's virtual host exists and its user may use it.
///
/// Implementations must be safe to call repeatedly for the same connection.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    async fn ensure_vhost(&self, config: &ConnectionConfig) -> Result<()>;
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Permissions {
    pub configure: String,
    pub write: String,
    pub read: String,
}

impl Permissions {
    pub fn full() -> Self {
        Self {
            configure: ".*".to_string(),
            write: ".*".to_string(),
            read: ".*".to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct HttpManagementClient {
    client: Client,
}

impl HttpManagementClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn base_url(config: &ConnectionConfig) -> Result<Url> {
        let raw = format!("http://{}:{}/", config.host, config.management_port);
        Url::parse(&raw)
            .map_err(|e| RabbitMQError::ManagementError(format!("invalid base url {}: {}", raw, e)))
    }

    /// Joins `segments` under the base url, percent-encoding each one so a
    /// vhost such as `/` survives as a single path segment.
    pub fn endpoint(config: &ConnectionConfig, segments: &[&str]) -> Result<Url> {
        let mut url = Self::base_url(config)?;
        url.path_segments_mut()
            .map_err(|_| RabbitMQError::ManagementError("base url cannot hold a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn put(&self, config: &ConnectionConfig, url: Url, body: Option<&Permissions>) -> Result<()> {
        debug!(url = %url, "PUT management endpoint");

        let mut request = self
            .client
            .put(url.clone())
            .basic_auth(&config.username, Some(&config.password))
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        request = match body {
            Some(body) => request.json(body),
            None => request,
        };

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(RabbitMQError::ManagementError(format!(
                "PUT {} failed with status: {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ManagementApi for HttpManagementClient {
    async fn ensure_vhost(&self, config: &ConnectionConfig) -> Result<()> {
        let vhost_url = Self::endpoint(config, &["api", "vhosts", &config.vhost])?;
        self.put(config, vhost_url, None).await?;

        let permissions_url =
            Self::endpoint(config, &["api", "permissions", &config.vhost, &config.username])?;
        self.put(config, permissions_url, Some(&Permissions::full())).await?;

        info!(vhost = %config.vhost, user = %config.username, "Virtual host ready");
        Ok(())
    }
}
