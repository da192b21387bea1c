use std::collections::HashMap;

use tracing::{info, warn};

use super::amqp_client::AmqpConnector;
use super::connection::ConnectionHandle;
use super::errors::{RabbitMQError, Result};
use super::management::ManagementApi;
use crate::config::RabbitConfig;

/// Logical connection name to its open connection. Built once, never mutated.
pub struct ConnectionRegistry {
    connections: HashMap<String, ConnectionHandle>,
}

impl ConnectionRegistry {
    /// Provisions each virtual host and then connects into it. The first
    /// failure aborts the whole build.
    pub async fn build(
        config: &RabbitConfig,
        management: &dyn ManagementApi,
        connector: &dyn AmqpConnector,
    ) -> Result<Self> {
        let mut connections = HashMap::with_capacity(config.connections.len());

        for (name, connection_config) in &config.connections {
            management.ensure_vhost(connection_config).await?;
            let connection = connector.connect(connection_config).await?;

            info!(connection = %name, vhost = %connection_config.vhost, "Connection registered");
            connections.insert(
                name.clone(),
                ConnectionHandle::new(name, &connection_config.vhost, connection),
            );
        }

        Ok(ConnectionRegistry { connections })
    }

    pub fn get(&self, name: &str) -> Result<&ConnectionHandle> {
        self.connections
            .get(name)
            .ok_or_else(|| RabbitMQError::UnknownConnection(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.connections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Closes every connection, even after a failure, and reports the first one.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for handle in self.connections.values() {
            if let Err(e) = handle.close().await {
                warn!(connection = %handle.name(), "Failed to close connection: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
