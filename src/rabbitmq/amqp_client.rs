// src/rabbitmq/amqp_client.rs

use std::time::Duration;

use async_trait::async_trait;
use lapin::options::{
    BasicGetOptions, BasicPublishOptions, ExchangeDeclareOptions, ExchangeDeleteOptions,
    QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions, QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use super::errors::Result;
use crate::config::{ConnectionConfig, ExchangeType};

/// Opens transport connections scoped to a connection's virtual host.
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    /// Every call yields a new channel with its own id.
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>>;

    async fn close(&self) -> Result<()>;
}

/// The protocol operations issued on a single channel.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_queue(&self, queue: &str, options: QueueDeclareOptions) -> Result<()>;

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
        options: ExchangeDeclareOptions,
    ) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn delete_exchange(&self, exchange: &str) -> Result<()>;

    async fn delete_queue(&self, queue: &str) -> Result<()>;

    /// Returns the number of messages removed.
    async fn purge_queue(&self, queue: &str) -> Result<u32>;

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    async fn get_one(&self, queue: &str, auto_ack: bool) -> Result<Option<Vec<u8>>>;

    async fn close(&self) -> Result<()>;
}

/// Connects through lapin.
#[derive(Debug, Clone, Default)]
pub struct LapinConnector {
    connect_timeout: Option<Duration>,
}

impl LapinConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

pub fn amqp_uri(config: &ConnectionConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.vhost.clone(),
        query: AMQPQueryString::default(),
    }
}

#[async_trait]
impl AmqpConnector for LapinConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn AmqpConnection>> {
        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "Connecting to RabbitMQ"
        );

        let connect = Connection::connect_uri(amqp_uri(config), ConnectionProperties::default());
        let connection = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect).await??,
            None => connect.await?,
        };

        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });

        debug!(vhost = %config.vhost, "Successfully connected to RabbitMQ");
        Ok(Box::new(LapinConnection(connection)))
    }
}

pub struct LapinConnection(Connection);

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>> {
        let channel = self.0.create_channel().await?;
        Ok(Box::new(LapinChannel(channel)))
    }

    async fn close(&self) -> Result<()> {
        if self.0.status().connected() {
            self.0.close(200, "Closing fixtures connection").await?;
        }
        Ok(())
    }
}

pub struct LapinChannel(Channel);

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_queue(&self, queue: &str, options: QueueDeclareOptions) -> Result<()> {
        self.0.queue_declare(queue, options, FieldTable::default()).await?;
        Ok(())
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeType,
        options: ExchangeDeclareOptions,
    ) -> Result<()> {
        self.0
            .exchange_declare(exchange, kind.into(), options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.0
            .queue_bind(queue, exchange, routing_key, QueueBindOptions::default(), FieldTable::default())
            .await?;
        Ok(())
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<()> {
        self.0.exchange_delete(exchange, ExchangeDeleteOptions::default()).await?;
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<()> {
        self.0.queue_delete(queue, QueueDeleteOptions::default()).await?;
        Ok(())
    }

    async fn purge_queue(&self, queue: &str) -> Result<u32> {
        Ok(self.0.queue_purge(queue, QueuePurgeOptions::default()).await?)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        // The returned confirm is dropped: the channel is not in confirm mode.
        self.0
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                BasicProperties::default(),
            )
            .await?;
        Ok(())
    }

    async fn get_one(&self, queue: &str, auto_ack: bool) -> Result<Option<Vec<u8>>> {
        let message = self.0.basic_get(queue, BasicGetOptions { no_ack: auto_ack }).await?;
        Ok(message.map(|message| message.delivery.data))
    }

    async fn close(&self) -> Result<()> {
        if self.0.status().connected() {
            self.0.close(200, "Operation complete").await?;
        }
        Ok(())
    }
}
