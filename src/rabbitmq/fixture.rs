use tracing::{debug, info, instrument};

use super::amqp_client::{AmqpConnector, LapinConnector};
use super::errors::{RabbitMQError, Result};
use super::management::{HttpManagementClient, ManagementApi};
use super::provisioner::{provision_exchange, DEFAULT_ROUTING_KEY};
use super::registry::ConnectionRegistry;
use crate::config::RabbitConfig;
use crate::env::Settings;

/// Broker-side test fixtures: provisioned topology plus the publish, fetch and
/// purge operations tests drive through named connections.
pub struct RabbitFixture {
    registry: ConnectionRegistry,
}

impl RabbitFixture {
    /// Provisions everything in `config` against real brokers.
    pub async fn connect(config: &RabbitConfig, settings: &Settings) -> Result<Self> {
        let management = HttpManagementClient::new();
        let connector = LapinConnector::new().with_connect_timeout(settings.connect_timeout());
        Self::with_clients(config, &management, &connector).await
    }

    /// Builds the connection registry, then provisions every configured
    /// exchange. Any failure aborts construction.
    pub async fn with_clients(
        config: &RabbitConfig,
        management: &dyn ManagementApi,
        connector: &dyn AmqpConnector,
    ) -> Result<Self> {
        let registry = ConnectionRegistry::build(config, management, connector).await?;

        for (name, connection_config) in &config.connections {
            let handle = registry.get(name)?;
            for (exchange, exchange_config) in &connection_config.exchanges {
                provision_exchange(handle, exchange, exchange_config).await?;
            }
        }

        info!(connections = registry.len(), "Fixtures ready");
        Ok(RabbitFixture { registry })
    }

    /// Connects without declaring topology, so queued messages survive.
    pub async fn attach(config: &RabbitConfig, settings: &Settings) -> Result<Self> {
        let management = HttpManagementClient::new();
        let connector = LapinConnector::new().with_connect_timeout(settings.connect_timeout());
        let registry = ConnectionRegistry::build(config, &management, &connector).await?;
        Ok(RabbitFixture::from_registry(registry))
    }

    pub fn from_registry(registry: ConnectionRegistry) -> Self {
        RabbitFixture { registry }
    }

    pub fn connection_names(&self) -> Vec<&str> {
        self.registry.names()
    }

    /// Fire-and-forget: no publisher confirm is awaited.
    #[instrument(skip(self, content))]
    pub async fn publish(
        &self,
        exchange: &str,
        content: &str,
        connection: &str,
        routing_key: Option<&str>,
    ) -> Result<()> {
        let handle = self.registry.get(connection)?;
        handle
            .publish(exchange, routing_key.unwrap_or(DEFAULT_ROUTING_KEY), content.as_bytes())
            .await?;
        debug!("Published message");
        Ok(())
    }

    /// Takes at most one message, auto-acknowledged. Never waits for one to arrive.
    ///
    /// A body that is not UTF-8 is returned inside
    /// [`RabbitMQError::DeserializationError`], since the broker has already dropped it.
    #[instrument(skip(self))]
    pub async fn fetch_one(&self, queue: &str, connection: &str) -> Result<Option<String>> {
        match self.fetch_raw(queue, connection).await? {
            Some(body) => String::from_utf8(body).map(Some).map_err(|e| {
                let reason = e.utf8_error().to_string();
                RabbitMQError::DeserializationError {
                    queue: queue.to_string(),
                    body: e.into_bytes(),
                    reason,
                }
            }),
            None => Ok(None),
        }
    }

    async fn fetch_raw(&self, queue: &str, connection: &str) -> Result<Option<Vec<u8>>> {
        let handle = self.registry.get(connection)?;
        handle.get_one(queue, true).await
    }

    /// Empties the queue; a queue that does not exist counts as empty.
    #[instrument(skip(self))]
    pub async fn purge(&self, queue: &str, connection: &str) -> Result<()> {
        let handle = self.registry.get(connection)?;
        match handle.purge_queue(queue).await {
            Ok(purged) => {
                debug!(purged, "Purged queue");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Fails if a message could be fetched. That message is consumed by the check.
    pub async fn assert_empty(&self, queue: &str, connection: &str) -> Result<()> {
        match self.fetch_raw(queue, connection).await? {
            None => Ok(()),
            Some(body) => Err(RabbitMQError::QueueNotEmpty {
                queue: queue.to_string(),
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.registry.close().await
    }
}
